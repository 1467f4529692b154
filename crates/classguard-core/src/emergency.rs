//! Out-of-band help requests.
//!
//! Raising never waits: the request is written to the emergency partition and
//! the caller gets a handle whose status changes when the backend
//! acknowledges it.

use chrono::{DateTime, Utc};
use classguard_storage::{EmergencyRequest, OutboxPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::CoreError;
use crate::event_buffer::EventBuffer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyStatus {
    Pending,
    Acknowledged(DateTime<Utc>),
    /// Permanently failed or rejected by the backend
    Undeliverable(String),
}

impl std::fmt::Display for EmergencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Acknowledged(at) => write!(f, "acknowledged at {}", at.format("%H:%M:%S")),
            Self::Undeliverable(reason) => write!(f, "undeliverable: {reason}"),
        }
    }
}

/// Caller's view of a raised request
#[derive(Debug, Clone)]
pub struct EmergencyHandle {
    request_id: Uuid,
    status: watch::Receiver<EmergencyStatus>,
}

impl EmergencyHandle {
    #[must_use]
    pub const fn request_id(&self) -> Uuid {
        self.request_id
    }

    #[must_use]
    pub fn status(&self) -> EmergencyStatus {
        self.status.borrow().clone()
    }

    /// Wait until the request leaves `Pending`
    pub async fn acknowledged(&mut self) -> EmergencyStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current != EmergencyStatus::Pending {
                return current;
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RaiseError {
    /// Same request raised inside the cool-down. The original keeps its status.
    #[error("help request already raised, retry in {}s", .retry_after.as_secs())]
    Denied {
        original: EmergencyHandle,
        retry_after: Duration,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

type RequestKey = (Option<Uuid>, String);

struct Tracked {
    raised: Instant,
    status: watch::Sender<EmergencyStatus>,
}

impl Tracked {
    fn handle(&self, request_id: Uuid) -> EmergencyHandle {
        EmergencyHandle {
            request_id,
            status: self.status.subscribe(),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    requests: HashMap<Uuid, Tracked>,
    latest: HashMap<RequestKey, Uuid>,
}

pub struct EmergencyChannel {
    device_id: String,
    buffer: Arc<EventBuffer>,
    cooldown: Duration,
    state: Mutex<ChannelState>,
}

fn request_key(session_id: Option<Uuid>, reason: &str) -> RequestKey {
    (session_id, reason.trim().to_lowercase())
}

impl EmergencyChannel {
    #[must_use]
    pub fn new(device_id: String, buffer: Arc<EventBuffer>, cooldown: Duration) -> Self {
        Self {
            device_id,
            buffer,
            cooldown,
            state: Mutex::new(ChannelState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a help request. Works in every session state.
    ///
    /// # Errors
    ///
    /// Returns `RaiseError::Denied` with the original handle inside the
    /// cool-down, `RaiseError::Core` if the request cannot be written
    pub fn raise(
        &self,
        session_id: Option<Uuid>,
        reason: &str,
    ) -> Result<EmergencyHandle, RaiseError> {
        let key = request_key(session_id, reason);
        let mut state = self.state();

        if let Some((original_id, tracked)) = state
            .latest
            .get(&key)
            .and_then(|id| state.requests.get(id).map(|t| (*id, t)))
        {
            let elapsed = tracked.raised.elapsed();
            if elapsed < self.cooldown {
                log::info!("Help request {original_id} re-raised inside cool-down");
                return Err(RaiseError::Denied {
                    original: tracked.handle(original_id),
                    retry_after: self.cooldown - elapsed,
                });
            }
        }

        let request = EmergencyRequest {
            device_id: self.device_id.clone(),
            session_id,
            request_id: Uuid::new_v4(),
            reason: reason.trim().to_string(),
            raised_at: Utc::now(),
            acknowledged_at: None,
        };
        let request_id = request.request_id;
        self.buffer.enqueue(OutboxPayload::Emergency(request))?;
        log::warn!("Help request {request_id} raised");

        let cooldown = self.cooldown;
        let ChannelState { requests, latest } = &mut *state;
        requests.retain(|_, t| {
            t.raised.elapsed() < cooldown || *t.status.borrow() == EmergencyStatus::Pending
        });
        latest.retain(|_, id| requests.contains_key(id));

        let (status, _) = watch::channel(EmergencyStatus::Pending);
        let tracked = Tracked {
            raised: Instant::now(),
            status,
        };
        let handle = tracked.handle(request_id);
        requests.insert(request_id, tracked);
        latest.insert(key, request_id);
        Ok(handle)
    }

    fn settle(&self, request_id: Uuid, status: EmergencyStatus) -> bool {
        let state = self.state();
        let Some(tracked) = state.requests.get(&request_id) else {
            return false;
        };
        log::info!("Help request {request_id}: {status}");
        tracked.status.send_replace(status);
        true
    }

    /// Returns `false` for a request this channel never tracked
    pub fn acknowledge(&self, request_id: Uuid, at: DateTime<Utc>) -> bool {
        self.settle(request_id, EmergencyStatus::Acknowledged(at))
    }

    pub fn mark_undeliverable(&self, request_id: Uuid, reason: &str) -> bool {
        self.settle(request_id, EmergencyStatus::Undeliverable(reason.to_string()))
    }

    #[must_use]
    pub fn handle(&self, request_id: Uuid) -> Option<EmergencyHandle> {
        self.state()
            .requests
            .get(&request_id)
            .map(|t| t.handle(request_id))
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state()
            .requests
            .values()
            .filter(|t| *t.status.borrow() == EmergencyStatus::Pending)
            .count()
    }

    /// Track requests still in the outbox after a restart. The cool-down
    /// keeps counting from the original raise time.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the outbox cannot be read
    pub fn restore_pending(&self) -> Result<usize, CoreError> {
        let entries = self.buffer.database().unsettled_emergency_entries()?;
        let mut state = self.state();
        let mut restored = 0;

        for entry in entries {
            let OutboxPayload::Emergency(request) = entry.payload else {
                continue;
            };
            let age = (Utc::now() - request.raised_at)
                .to_std()
                .unwrap_or_default();
            let raised = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
            let key = request_key(request.session_id, &request.reason);
            let (status, _) = watch::channel(EmergencyStatus::Pending);

            state.latest.insert(key, request.request_id);
            state
                .requests
                .insert(request.request_id, Tracked { raised, status });
            restored += 1;
        }

        if restored > 0 {
            log::info!("Restored {restored} pending help request(s)");
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entries, memory_buffer};
    use classguard_storage::Partition;

    fn channel(cooldown: Duration) -> (EmergencyChannel, Arc<EventBuffer>) {
        let buffer = memory_buffer();
        (
            EmergencyChannel::new("dev-1".to_string(), Arc::clone(&buffer), cooldown),
            buffer,
        )
    }

    #[test]
    fn test_raise_is_durable_and_pending() {
        let (channel, buffer) = channel(Duration::from_secs(60));
        let handle = channel.raise(None, "Need help").unwrap();

        assert_eq!(handle.status(), EmergencyStatus::Pending);
        let stored = entries(&buffer, Partition::Emergency);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload.request_id(), Some(handle.request_id()));
        assert_eq!(channel.pending_count(), 1);
    }

    #[test]
    fn test_duplicate_inside_cooldown_is_denied() {
        let (channel, buffer) = channel(Duration::from_secs(60));
        let session = Some(Uuid::new_v4());
        let original = channel.raise(session, "Need help").unwrap();

        let Err(RaiseError::Denied {
            original: denied,
            retry_after,
        }) = channel.raise(session, "  need HELP ")
        else {
            panic!("expected denial");
        };
        assert_eq!(denied.request_id(), original.request_id());
        assert!(retry_after <= Duration::from_secs(60));
        assert_eq!(entries(&buffer, Partition::Emergency).len(), 1);

        // Denial does not disturb the original
        assert!(channel.acknowledge(original.request_id(), Utc::now()));
        assert!(matches!(
            denied.status(),
            EmergencyStatus::Acknowledged(_)
        ));
    }

    #[test]
    fn test_different_reason_or_session_is_new_request() {
        let (channel, buffer) = channel(Duration::from_secs(60));
        channel.raise(None, "Need help").unwrap();
        channel.raise(None, "Feeling unwell").unwrap();
        channel.raise(Some(Uuid::new_v4()), "Need help").unwrap();
        assert_eq!(entries(&buffer, Partition::Emergency).len(), 3);
    }

    #[test]
    fn test_raise_allowed_after_cooldown() {
        let (channel, buffer) = channel(Duration::ZERO);
        let first = channel.raise(None, "help").unwrap();
        let second = channel.raise(None, "help").unwrap();
        assert_ne!(first.request_id(), second.request_id());
        assert_eq!(entries(&buffer, Partition::Emergency).len(), 2);
    }

    #[tokio::test]
    async fn test_handle_resolves_on_ack() {
        let (channel, _buffer) = channel(Duration::from_secs(60));
        let channel = Arc::new(channel);
        let mut handle = channel.raise(None, "help").unwrap();
        let request_id = handle.request_id();

        let acker = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            acker.acknowledge(request_id, Utc::now());
        });

        assert!(matches!(
            handle.acknowledged().await,
            EmergencyStatus::Acknowledged(_)
        ));
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_undeliverable() {
        let (channel, _buffer) = channel(Duration::from_secs(60));
        let handle = channel.raise(None, "help").unwrap();
        assert!(channel.mark_undeliverable(handle.request_id(), "invalid-session"));
        assert_eq!(
            handle.status(),
            EmergencyStatus::Undeliverable("invalid-session".to_string())
        );
        assert!(!channel.acknowledge(Uuid::new_v4(), Utc::now()));
    }

    #[test]
    fn test_restore_pending_after_restart() {
        let buffer = memory_buffer();
        let request_id = {
            let channel =
                EmergencyChannel::new("dev-1".to_string(), Arc::clone(&buffer), Duration::from_secs(60));
            channel.raise(None, "help").unwrap().request_id()
        };

        let channel =
            EmergencyChannel::new("dev-1".to_string(), Arc::clone(&buffer), Duration::from_secs(60));
        assert_eq!(channel.restore_pending().unwrap(), 1);
        let handle = channel.handle(request_id).unwrap();
        assert_eq!(handle.status(), EmergencyStatus::Pending);

        // Still inside the original cool-down
        assert!(matches!(
            channel.raise(None, "help"),
            Err(RaiseError::Denied { .. })
        ));
    }
}
