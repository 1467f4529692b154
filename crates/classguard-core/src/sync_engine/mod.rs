//! Drains the outbox to the backend and feeds pushed commands back to the
//! session controller.
//!
//! Delivery is at-least-once. Every item carries its idempotency key and a
//! `duplicate` reply counts as delivered, so resending after a crash or a
//! lost reply is always safe.

mod push;
#[cfg(test)]
mod tests;

pub use push::{spawn_push_listener, CommandDeduper};

use chrono::{DateTime, Utc};
use classguard_integrations::{
    BackendError, IngestItem, IngestionBackend, ItemOutcome, PushCommand,
};
use classguard_storage::{FailureOutcome, OutboxEntry, OutboxPayload, Partition};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_buffer::{EventBuffer, PartitionLease};

/// Everything the sync side reports to the session controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    /// Pushed command, in arrival order, already deduplicated
    Command(PushCommand),
    EmergencyAcknowledged {
        request_id: Uuid,
        at: DateTime<Utc>,
    },
    EmergencyUndeliverable {
        request_id: Uuid,
        reason: String,
    },
    FinalizeOutcome {
        session_id: Uuid,
        confirmed: bool,
    },
    /// Entries failed permanently
    SyncDegraded(String),
    /// Credentials rejected; sending is suspended
    AuthExpired,
    /// The backend accepted requests again after an auth suspension
    AuthRestored,
}

/// Work the controller asks of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    Finalize { session_id: Uuid },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub auth_suspended: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What one drain cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub sent: usize,
    pub acked: usize,
    /// Part of `acked`: the backend already had them
    pub duplicates: usize,
    pub failed: usize,
    pub permanent: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: Self) {
        self.sent += other.sent;
        self.acked += other.acked;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.permanent += other.permanent;
    }
}

/// Exponential delay with jitter: a random point in the upper half of
/// `base * 2^(failures - 1)`, capped at `max`
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    let ceiling = base.saturating_mul(1u32 << exponent).min(max);
    let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    if ceiling_ms < 2 {
        return ceiling;
    }
    Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
}

fn to_ingest_item(entry: &OutboxEntry) -> CoreResult<IngestItem> {
    let payload = match &entry.payload {
        OutboxPayload::Attention(event) => serde_json::to_value(event),
        OutboxPayload::Enforcement(event) => serde_json::to_value(event),
        OutboxPayload::Emergency(request) => serde_json::to_value(request),
    }
    .map_err(anyhow::Error::from)?;

    Ok(IngestItem {
        device_id: entry.payload.device_id().to_string(),
        session_id: entry.payload.session_id(),
        sequence_number: entry.payload.sequence_number(),
        request_id: entry.payload.request_id(),
        kind: entry.partition.as_str().to_string(),
        payload,
        captured_at: entry.payload.occurred_at(),
    })
}

pub struct SyncEngine {
    device_id: String,
    buffer: Arc<EventBuffer>,
    backend: Arc<dyn IngestionBackend>,
    config: SyncConfig,
    messages: mpsc::Sender<ControllerMessage>,
    connectivity: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        device_id: String,
        buffer: Arc<EventBuffer>,
        backend: Arc<dyn IngestionBackend>,
        config: SyncConfig,
        messages: mpsc::Sender<ControllerMessage>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let online = *connectivity.borrow();
        let (status, _) = watch::channel(SyncStatus {
            online,
            ..SyncStatus::default()
        });
        Self {
            device_id,
            buffer,
            backend,
            config,
            messages,
            connectivity,
            status,
        }
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    async fn notify(&self, message: ControllerMessage) {
        if self.messages.send(message).await.is_err() {
            log::debug!("Controller gone, dropping sync message");
        }
    }

    fn record_failure(&self, error: &CoreError) {
        self.status.send_modify(|status| {
            status.consecutive_failures += 1;
            status.last_error = Some(error.to_string());
            status.auth_suspended = matches!(error, CoreError::AuthExpired);
        });
    }

    /// Returns `true` when this success lifts an auth suspension
    fn record_success(&self) -> bool {
        let mut resumed = false;
        self.status.send_modify(|status| {
            resumed = status.auth_suspended;
            status.consecutive_failures = 0;
            status.auth_suspended = false;
            status.last_error = None;
            status.last_success_at = Some(Utc::now());
        });
        resumed
    }

    /// Drain every partition once, highest priority first.
    ///
    /// Stops at the first batch-level failure: transient failures use up an
    /// attempt on the batch, an auth failure returns it untouched.
    ///
    /// # Errors
    ///
    /// Returns `TransientNetwork` or `AuthExpired` for a failed send and
    /// `Storage` if the outbox cannot be updated
    pub async fn run_cycle(&self) -> CoreResult<SyncReport> {
        let online = *self.connectivity.borrow();
        self.status.send_if_modified(|status| {
            let changed = status.online != online;
            status.online = online;
            changed
        });
        if !online {
            return Ok(SyncReport::default());
        }

        self.buffer.promote_due()?;

        let mut report = SyncReport::default();
        for partition in Partition::BY_PRIORITY {
            let Some(lease) = self.buffer.claim(partition) else {
                log::debug!("{partition} partition busy, skipping");
                continue;
            };
            match self.drain(&lease).await {
                Ok(drained) => report.absorb(drained),
                Err(e) => {
                    self.record_failure(&e);
                    return Err(e);
                }
            }
        }

        if report.sent > 0 {
            if self.record_success() {
                log::info!("Backend accepts credentials again, sync resumed");
                self.notify(ControllerMessage::AuthRestored).await;
            }
            log::debug!("Sync cycle: {report:?}");
        }
        if report.permanent > 0 {
            self.notify(ControllerMessage::SyncDegraded(format!(
                "{} outbox entries failed permanently",
                report.permanent
            )))
            .await;
        }
        Ok(report)
    }

    async fn drain(&self, lease: &PartitionLease<'_>) -> CoreResult<SyncReport> {
        let mut report = SyncReport::default();
        loop {
            let batch = self
                .buffer
                .dequeue_batch(lease, self.config.batch_size.max(1))?;
            if batch.is_empty() {
                return Ok(report);
            }
            report.absorb(self.send(&batch).await?);
        }
    }

    /// Send one dequeued batch and settle every entry in it
    async fn send(&self, batch: &[OutboxEntry]) -> CoreResult<SyncReport> {
        let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
        let items = match batch.iter().map(to_ingest_item).collect::<CoreResult<Vec<_>>>() {
            Ok(items) => items,
            Err(e) => {
                self.buffer.requeue(&ids)?;
                return Err(e);
            }
        };

        match self.backend.send_batch(&items).await {
            Ok(results) => {
                let mut outcomes: HashMap<String, ItemOutcome> = results
                    .into_iter()
                    .map(|result| (result.key.clone(), result.outcome()))
                    .collect();
                let mut report = SyncReport {
                    sent: batch.len(),
                    ..SyncReport::default()
                };
                let mut acked = Vec::new();
                for (entry, item) in batch.iter().zip(&items) {
                    let outcome = outcomes.remove(&item.key()).unwrap_or_else(|| {
                        ItemOutcome::Rejected("missing from reply".to_string())
                    });
                    if self.settle(entry, outcome, &mut report).await? {
                        acked.push(entry.id);
                    }
                }
                report.acked = self.buffer.mark_acked(&acked)?;
                Ok(report)
            }
            Err(BackendError::AuthExpired { status }) => {
                log::warn!("Backend rejected credentials ({status}), suspending sync");
                self.buffer.requeue(&ids)?;
                self.notify(ControllerMessage::AuthExpired).await;
                Err(CoreError::AuthExpired)
            }
            Err(e) => {
                let reason = e.to_string();
                log::warn!("Sending {} entries failed: {reason}", batch.len());
                let outcomes = self.buffer.mark_failed(&ids, &reason)?;
                self.settle_permanent(batch, &outcomes, &reason).await;
                let permanent = outcomes.iter().filter(|o| o.permanent).count();
                if permanent > 0 {
                    self.notify(ControllerMessage::SyncDegraded(format!(
                        "{permanent} outbox entries failed permanently"
                    )))
                    .await;
                }
                Err(CoreError::TransientNetwork(reason))
            }
        }
    }

    /// Apply one per-item verdict. Returns `true` when the entry should be
    /// marked acked.
    async fn settle(
        &self,
        entry: &OutboxEntry,
        outcome: ItemOutcome,
        report: &mut SyncReport,
    ) -> CoreResult<bool> {
        let request_id = entry.payload.request_id();
        match outcome {
            ItemOutcome::Accepted | ItemOutcome::Duplicate => {
                if outcome == ItemOutcome::Duplicate {
                    report.duplicates += 1;
                }
                if let Some(request_id) = request_id {
                    self.notify(ControllerMessage::EmergencyAcknowledged {
                        request_id,
                        at: Utc::now(),
                    })
                    .await;
                }
                Ok(true)
            }
            ItemOutcome::InvalidSession => {
                self.buffer.mark_rejected(&[entry.id], "invalid-session")?;
                report.permanent += 1;
                if let Some(request_id) = request_id {
                    self.notify(ControllerMessage::EmergencyUndeliverable {
                        request_id,
                        reason: "invalid-session".to_string(),
                    })
                    .await;
                }
                Ok(false)
            }
            ItemOutcome::Rejected(reason) => {
                let failed = self.buffer.mark_failed(&[entry.id], &reason)?;
                report.failed += 1;
                report.permanent += failed.iter().filter(|f| f.permanent).count();
                self.settle_permanent(std::slice::from_ref(entry), &failed, &reason)
                    .await;
                Ok(false)
            }
        }
    }

    async fn settle_permanent(
        &self,
        batch: &[OutboxEntry],
        outcomes: &[FailureOutcome],
        reason: &str,
    ) {
        for outcome in outcomes.iter().filter(|o| o.permanent) {
            let request_id = batch
                .iter()
                .find(|e| e.id == outcome.id)
                .and_then(|e| e.payload.request_id());
            if let Some(request_id) = request_id {
                self.notify(ControllerMessage::EmergencyUndeliverable {
                    request_id,
                    reason: reason.to_string(),
                })
                .await;
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
            attempt,
        )
    }

    /// Deliver the session's emergency requests, then ask the backend to
    /// finalize. Returns whether the backend confirmed within the budget.
    pub async fn finalize(&self, session_id: Uuid) -> bool {
        self.flush_emergencies(session_id).await;
        self.request_finalize(session_id).await
    }

    async fn flush_emergencies(&self, session_id: Uuid) {
        let attempts = self.config.finalize_attempts.max(1);
        for attempt in 1..=attempts {
            let outstanding = self.drain_emergencies(session_id).await.unwrap_or_else(|e| {
                log::warn!("Draining help requests before finalize: {e}");
                1
            });
            if outstanding == 0 {
                return;
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }
        }
        log::warn!("Help requests for {session_id} still undelivered at finalize");
    }

    async fn request_finalize(&self, session_id: Uuid) -> bool {
        let attempts = self.config.finalize_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .backend
                .finalize_session(&self.device_id, session_id)
                .await
            {
                Ok(()) => {
                    log::info!("Session {session_id} finalized by backend");
                    return true;
                }
                Err(BackendError::AuthExpired { .. }) => {
                    log::warn!("Finalize of {session_id} rejected: credentials expired");
                    self.notify(ControllerMessage::AuthExpired).await;
                    return false;
                }
                Err(e) => {
                    log::warn!("Finalize attempt {attempt}/{attempts} for {session_id}: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }
        false
    }

    async fn drain_emergencies(&self, session_id: Uuid) -> CoreResult<u64> {
        if !*self.connectivity.borrow() {
            return Err(CoreError::TransientNetwork("offline".to_string()));
        }
        self.buffer.promote_due()?;
        if let Some(lease) = self.buffer.claim(Partition::Emergency) {
            self.drain(&lease).await?;
        }
        self.buffer.unsettled(Partition::Emergency, Some(session_id))
    }

    /// Background loop: drain on every poll tick or connectivity change, back
    /// off after failures, serve finalize requests. In-flight batches finish
    /// before shutdown is observed.
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<SyncRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut delay = Duration::ZERO;
        let mut failures = 0u32;
        let mut connectivity = self.connectivity.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(request) = requests.recv() => match request {
                    SyncRequest::Finalize { session_id } => {
                        let confirmed = self.finalize(session_id).await;
                        self.notify(ControllerMessage::FinalizeOutcome { session_id, confirmed })
                            .await;
                        continue;
                    }
                },
                Ok(()) = connectivity.changed() => {
                    let online = *connectivity.borrow_and_update();
                    log::info!("Connectivity {}", if online { "restored" } else { "lost" });
                    if online {
                        failures = 0;
                    }
                }
                () = tokio::time::sleep(delay) => {}
            }

            delay = match self.run_cycle().await {
                Ok(_) => {
                    failures = 0;
                    poll
                }
                Err(CoreError::AuthExpired) => Duration::from_millis(self.config.backoff_max_ms),
                Err(e) => {
                    failures += 1;
                    let delay = self.retry_delay(failures);
                    log::warn!("Sync failed ({e}), backing off {}ms", delay.as_millis());
                    delay
                }
            };

            if let Err(e) = self.buffer.purge_expired() {
                log::warn!("Outbox purge failed: {e}");
            }
        }

        log::info!("Sync engine stopped");
    }
}
