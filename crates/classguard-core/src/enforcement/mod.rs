//! Overlay enforcement with escape detection.
//!
//! ```text
//! Inactive -> Locked -> Escaped -> Locked      (focus back within grace, RESTORED)
//!                               -> Escalated   (grace expired, ESCALATED)
//! Escalated -> Locked                          (focus back, RESTORED)
//! any -> Inactive                              (session stopped, RELEASED)
//! ```
//!
//! Every transition appends exactly one enforcement event. The overlay is
//! driven before the event is written so an aborted reactor never leaves an
//! event without its state change.

#[cfg(test)]
mod tests;

use chrono::Utc;
use classguard_storage::{Decision, EnforcementEvent, EnforcementKind, OutboxPayload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EnforcementConfig;
use crate::device::{FocusObserver, OverlaySurface};
use crate::error::CoreResult;
use crate::event_buffer::EventBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Inactive,
    Locked,
    /// Focus lost; the grace timer runs from `since`
    Escaped { since: Instant },
    /// Grace expired; the overlay is raised again every reassert interval
    Escalated { last_reassert: Instant },
}

impl GuardState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Locked => "locked",
            Self::Escaped { .. } => "escaped",
            Self::Escalated { .. } => "escalated",
        }
    }
}

/// Shared between the classification loop, the focus reactor and the
/// session controller
pub type GuardHandle = Arc<Mutex<EnforcementGuard>>;

pub struct EnforcementGuard {
    state: GuardState,
    device_id: String,
    session_id: Uuid,
    buffer: Arc<EventBuffer>,
    overlay: Arc<dyn OverlaySurface>,
    grace: Duration,
    reassert_every: Duration,
}

impl EnforcementGuard {
    #[must_use]
    pub fn new(
        device_id: String,
        session_id: Uuid,
        buffer: Arc<EventBuffer>,
        overlay: Arc<dyn OverlaySurface>,
        config: &EnforcementConfig,
    ) -> Self {
        Self {
            state: GuardState::Inactive,
            device_id,
            session_id,
            buffer,
            overlay,
            grace: Duration::from_secs(config.grace_period_secs),
            reassert_every: Duration::from_secs(config.reassert_interval_secs.max(1)),
        }
    }

    #[must_use]
    pub fn into_handle(self) -> GuardHandle {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub const fn state(&self) -> GuardState {
        self.state
    }

    /// When `on_timer` next has work to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            GuardState::Escaped { since } => Some(since + self.grace),
            GuardState::Escalated { last_reassert } => Some(last_reassert + self.reassert_every),
            GuardState::Inactive | GuardState::Locked => None,
        }
    }

    fn emit(&mut self, kind: EnforcementKind, next: GuardState) -> CoreResult<EnforcementKind> {
        self.buffer
            .enqueue(OutboxPayload::Enforcement(EnforcementEvent {
                device_id: self.device_id.clone(),
                session_id: self.session_id,
                sequence_number: 0,
                kind,
                at: Utc::now(),
            }))?;
        log::info!(
            "Enforcement {} -> {} ({kind})",
            self.state.name(),
            next.name()
        );
        self.state = next;
        Ok(kind)
    }

    /// Enter `Locked` from `Inactive`. Anything else is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event cannot be written
    pub async fn lock(&mut self) -> CoreResult<Option<EnforcementKind>> {
        if self.state != GuardState::Inactive {
            return Ok(None);
        }
        if let Err(e) = self.overlay.show().await {
            log::warn!("Failed to show overlay: {e:#}");
        }
        self.emit(EnforcementKind::Locked, GuardState::Locked)
            .map(Some)
    }

    /// Feed a classification decision. ALLOW never unlocks.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event cannot be written
    pub async fn on_decision(&mut self, decision: Decision) -> CoreResult<Option<EnforcementKind>> {
        match decision {
            Decision::Block => self.lock().await,
            Decision::Allow => Ok(None),
        }
    }

    /// Feed a focus reading
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event cannot be written
    pub async fn on_focus(
        &mut self,
        foreground: bool,
        now: Instant,
    ) -> CoreResult<Option<EnforcementKind>> {
        match (self.state, foreground) {
            (GuardState::Locked, false) => self
                .emit(EnforcementKind::Escaped, GuardState::Escaped { since: now })
                .map(Some),
            (GuardState::Escaped { .. } | GuardState::Escalated { .. }, true) => {
                if let Err(e) = self.overlay.reassert().await {
                    log::warn!("Failed to reassert overlay: {e:#}");
                }
                self.emit(EnforcementKind::Restored, GuardState::Locked)
                    .map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Advance the grace / reassert timer
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event cannot be written
    pub async fn on_timer(&mut self, now: Instant) -> CoreResult<Option<EnforcementKind>> {
        match self.state {
            GuardState::Escaped { since } if now.duration_since(since) >= self.grace => {
                if let Err(e) = self.overlay.reassert().await {
                    log::warn!("Failed to reassert overlay: {e:#}");
                }
                self.emit(
                    EnforcementKind::Escalated,
                    GuardState::Escalated { last_reassert: now },
                )
                .map(Some)
            }
            GuardState::Escalated { last_reassert }
                if now.duration_since(last_reassert) >= self.reassert_every =>
            {
                log::debug!("Reasserting overlay, focus still lost");
                if let Err(e) = self.overlay.reassert().await {
                    log::warn!("Failed to reassert overlay: {e:#}");
                }
                self.state = GuardState::Escalated { last_reassert: now };
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Drop the lock when the session stops
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the event cannot be written
    pub async fn release(&mut self) -> CoreResult<Option<EnforcementKind>> {
        if self.state == GuardState::Inactive {
            return Ok(None);
        }
        if let Err(e) = self.overlay.hide().await {
            log::warn!("Failed to hide overlay: {e:#}");
        }
        self.emit(EnforcementKind::Released, GuardState::Inactive)
            .map(Some)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Poll the focus observer and run the guard's timer until aborted
#[must_use]
pub fn spawn_reactor(
    guard: GuardHandle,
    focus: Arc<dyn FocusObserver>,
    poll_every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = guard.lock().await.next_deadline();

            let result = tokio::select! {
                _ = ticker.tick() => match focus.is_foreground().await {
                    Ok(foreground) => guard.lock().await.on_focus(foreground, Instant::now()).await,
                    Err(e) => {
                        log::debug!("Focus observer unavailable: {e:#}");
                        Ok(None)
                    }
                },
                () = sleep_until(deadline) => guard.lock().await.on_timer(Instant::now()).await,
            };

            if let Err(e) = result {
                log::error!("Enforcement reactor: {e}");
            }
        }
    })
}
