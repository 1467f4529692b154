//! Durable, bounded, multi-partition outbox.
//!
//! Every operation is a single SQLite transaction in `classguard-storage`.
//! This layer adds the exclusive per-partition dequeue lease, retry and
//! retention policy, and logging.

use chrono::Utc;
use classguard_storage::{
    CapacityPolicy, Database, FailureOutcome, OutboxEntry, OutboxPayload, Partition,
    PartitionStats, RetryPolicy, SequenceGap,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::error::{CoreError, CoreResult};

pub struct EventBuffer {
    db: Arc<Database>,
    capacity: CapacityPolicy,
    retry: RetryPolicy,
    retention: chrono::Duration,
    leases: Mutex<HashSet<Partition>>,
}

/// Exclusive right to dequeue from one partition; released on drop
#[derive(Debug)]
pub struct PartitionLease<'a> {
    buffer: &'a EventBuffer,
    partition: Partition,
}

impl PartitionLease<'_> {
    #[must_use]
    pub const fn partition(&self) -> Partition {
        self.partition
    }
}

impl Drop for PartitionLease<'_> {
    fn drop(&mut self) {
        self.buffer.leases().remove(&self.partition);
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("capacity", &self.capacity)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EventBuffer {
    #[must_use]
    pub fn new(db: Arc<Database>, config: &BufferConfig) -> Self {
        Self {
            db,
            capacity: config.capacity(),
            retry: config.retry(),
            retention: chrono::Duration::hours(
                i64::try_from(config.retention_hours).unwrap_or(72),
            ),
            leases: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashSet<Partition>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a payload. Durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the append transaction fails
    pub fn enqueue(&self, payload: OutboxPayload) -> CoreResult<OutboxEntry> {
        let outcome = self.db.append_outbox(payload, &self.capacity)?;
        if !outcome.dropped.is_empty() {
            log::warn!(
                "Dropped {} attention event(s) on overflow",
                outcome.dropped.len()
            );
        }
        Ok(outcome.entry)
    }

    /// Take the dequeue lease for a partition, `None` if someone holds it
    #[must_use]
    pub fn claim(&self, partition: Partition) -> Option<PartitionLease<'_>> {
        if self.leases().insert(partition) {
            Some(PartitionLease {
                buffer: self,
                partition,
            })
        } else {
            None
        }
    }

    /// Move up to `max` pending entries of the leased partition to `InFlight`
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the dequeue transaction fails
    pub fn dequeue_batch(
        &self,
        lease: &PartitionLease<'_>,
        max: usize,
    ) -> CoreResult<Vec<OutboxEntry>> {
        Ok(self
            .db
            .claim_outbox_batch(lease.partition, max, Utc::now())?)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the update fails
    pub fn mark_acked(&self, ids: &[i64]) -> CoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.db.mark_outbox_acked(ids, Utc::now())?)
    }

    /// Fail entries; those past the retry budget become permanent
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the update fails
    pub fn mark_failed(&self, ids: &[i64], error: &str) -> CoreResult<Vec<FailureOutcome>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes = self
            .db
            .mark_outbox_failed(ids, error, Utc::now(), &self.retry)?;
        for outcome in outcomes.iter().filter(|o| o.permanent) {
            log::error!(
                "Outbox entry {} failed permanently after {} attempts: {error}",
                outcome.id,
                outcome.attempts
            );
        }
        Ok(outcomes)
    }

    /// Fail entries permanently without retry
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the update fails
    pub fn mark_rejected(&self, ids: &[i64], reason: &str) -> CoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        log::error!("Backend rejected {} outbox entries: {reason}", ids.len());
        Ok(self.db.mark_outbox_rejected(ids, reason)?)
    }

    /// Return in-flight entries to pending without using up an attempt
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the update fails
    pub fn requeue(&self, ids: &[i64]) -> CoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        Ok(self.db.requeue_outbox(ids)?)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the update fails
    pub fn promote_due(&self) -> CoreResult<usize> {
        Ok(self.db.promote_due_retries(Utc::now())?)
    }

    /// Delete acked entries past the retention window
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the delete fails
    pub fn purge_expired(&self) -> CoreResult<usize> {
        let purged = self.db.purge_acked_outbox(Utc::now() - self.retention)?;
        if purged > 0 {
            log::debug!("Purged {purged} acked outbox entries");
        }
        Ok(purged)
    }

    /// Startup pass: reset interrupted sends and quarantine undecodable rows.
    /// Returns one `CorruptLocalState` per affected partition.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the outbox cannot be read at all
    pub fn recover(&self) -> CoreResult<Vec<CoreError>> {
        let reset = self.db.recover_in_flight()?;
        if reset > 0 {
            log::info!("Returned {reset} interrupted outbox entries to pending");
        }

        Ok(self
            .db
            .verify_outbox()?
            .into_iter()
            .map(|(partition, _)| CoreError::CorruptLocalState { partition })
            .collect())
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the query fails
    pub fn stats(&self) -> CoreResult<BTreeMap<Partition, PartitionStats>> {
        Ok(self.db.outbox_stats()?)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the query fails
    pub fn drop_count(&self) -> CoreResult<u64> {
        Ok(self.db.dropped_count()?)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the query fails
    pub fn gaps(&self, limit: usize) -> CoreResult<Vec<SequenceGap>> {
        Ok(self.db.sequence_gaps(limit)?)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the query fails
    pub fn permanent_failures(&self, limit: usize) -> CoreResult<Vec<OutboxEntry>> {
        Ok(self.db.permanent_outbox_failures(limit)?)
    }

    /// Entries still awaiting delivery
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the query fails
    pub fn unsettled(&self, partition: Partition, session_id: Option<Uuid>) -> CoreResult<u64> {
        Ok(self.db.unsettled_outbox_count(partition, session_id)?)
    }
}
