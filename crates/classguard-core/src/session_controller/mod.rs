//! Session lifecycle state machine.
//!
//! ```text
//! Idle -> Joining -> Active <-> Paused -> Finalizing -> Finalized
//! Active | Paused -> Idle          (end command, permission revoked, emergency-only)
//! Finalized -> Joining             (next start)
//! ```
//!
//! Only pushed commands and local emergency or permission events move the
//! state. Every transition is persisted before the call returns.


use chrono::{DateTime, Utc};
use classguard_integrations::{CommandKind, PushCommand, SessionPolicyOverride};
use classguard_storage::{ControllerSnapshot, Database, Role, Session, SessionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::classification_loop::ClassificationLoop;
use crate::config::{ClassificationConfig, CoreConfig, EnforcementConfig};
use crate::device::DeviceSet;
use crate::emergency::EmergencyChannel;
use crate::enforcement::{spawn_reactor, EnforcementGuard, GuardHandle};
use crate::error::{CoreError, CoreResult};
use crate::event_buffer::EventBuffer;
use crate::policy::SessionPolicy;
use crate::sync_engine::{ControllerMessage, SyncRequest};

/// What can move the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Command(CommandKind),
    /// Monitors are up, the join is complete
    Joined,
    /// Backend confirmed finalization or the retry budget ran out
    FinalizeSettled,
    PermissionRevoked,
    EmergencyOnly,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(kind) => write!(f, "{kind}"),
            Self::Joined => write!(f, "joined"),
            Self::FinalizeSettled => write!(f, "finalize-settled"),
            Self::PermissionRevoked => write!(f, "permission-revoked"),
            Self::EmergencyOnly => write!(f, "emergency-only"),
        }
    }
}

/// The transition table. `None` means the transition is invalid.
#[must_use]
pub const fn next_state(from: SessionState, trigger: Trigger) -> Option<SessionState> {
    use SessionState::{Active, Finalized, Finalizing, Idle, Joining, Paused};

    match (from, trigger) {
        (Idle | Finalized, Trigger::Command(CommandKind::Start)) => Some(Joining),
        (Joining, Trigger::Joined) | (Paused, Trigger::Command(CommandKind::Resume)) => {
            Some(Active)
        }
        (Active, Trigger::Command(CommandKind::Pause)) => Some(Paused),
        (Active | Paused, Trigger::Command(CommandKind::Finalize)) => Some(Finalizing),
        (Finalizing, Trigger::FinalizeSettled) => Some(Finalized),
        (
            Joining | Active | Paused,
            Trigger::Command(CommandKind::End) | Trigger::PermissionRevoked,
        )
        | (Active | Paused, Trigger::EmergencyOnly) => Some(Idle),
        _ => None,
    }
}

/// Snapshot for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub role: Role,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub monitoring: bool,
    /// Enforcement guard state while monitoring
    pub enforcement: Option<String>,
    pub sync_degraded: bool,
    pub auth_expired: bool,
    /// Only meaningful once finalized
    pub finalize_confirmed: Option<bool>,
}

struct Monitors {
    guard: GuardHandle,
    classification: JoinHandle<()>,
    reactor: JoinHandle<()>,
}

pub struct SessionController {
    device_id: String,
    role: Role,
    state: SessionState,
    session: Option<Session>,
    sync_degraded: bool,
    auth_expired: bool,
    policy_override: Option<SessionPolicyOverride>,
    classification: ClassificationConfig,
    enforcement: EnforcementConfig,
    buffer: Arc<EventBuffer>,
    devices: DeviceSet,
    emergency: Arc<EmergencyChannel>,
    sync_requests: mpsc::Sender<SyncRequest>,
    monitors: Option<Monitors>,
}

impl SessionController {
    #[must_use]
    pub fn new(
        config: &CoreConfig,
        buffer: Arc<EventBuffer>,
        devices: DeviceSet,
        emergency: Arc<EmergencyChannel>,
        sync_requests: mpsc::Sender<SyncRequest>,
    ) -> Self {
        Self {
            device_id: config.device.device_id.clone(),
            role: config.device.role,
            state: SessionState::Idle,
            session: None,
            sync_degraded: false,
            auth_expired: false,
            policy_override: None,
            classification: config.classification.clone(),
            enforcement: config.enforcement.clone(),
            buffer,
            devices,
            emergency,
            sync_requests,
            monitors: None,
        }
    }

    fn db(&self) -> &Arc<Database> {
        self.buffer.database()
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.session_id)
    }

    #[must_use]
    pub const fn is_monitoring(&self) -> bool {
        self.monitors.is_some()
    }

    pub async fn status(&self) -> SessionStatus {
        let enforcement = match &self.monitors {
            Some(monitors) => Some(monitors.guard.lock().await.state().name().to_string()),
            None => None,
        };
        SessionStatus {
            state: self.state,
            role: self.role,
            session_id: self.session_id(),
            started_at: self.session.as_ref().map(|s| s.started_at),
            monitoring: self.monitors.is_some(),
            enforcement,
            sync_degraded: self.sync_degraded,
            auth_expired: self.auth_expired,
            finalize_confirmed: (self.state == SessionState::Finalized)
                .then(|| self.session.as_ref().is_some_and(|s| s.finalize_confirmed)),
        }
    }

    fn persist(&self) -> CoreResult<()> {
        if let Some(session) = &self.session {
            self.db()
                .update_session_state(session.session_id, self.state)?;
        }
        self.db().save_controller_state(&ControllerSnapshot {
            state: self.state,
            session_id: self.session_id(),
            sync_degraded: self.sync_degraded,
        })?;
        Ok(())
    }

    /// Validate, run exit and entry actions, persist
    async fn transition(&mut self, trigger: Trigger) -> CoreResult<SessionState> {
        let from = self.state;
        let Some(to) = next_state(from, trigger) else {
            log::warn!("Rejected {trigger} in state {from}");
            return Err(CoreError::InvalidTransition {
                from,
                trigger: trigger.to_string(),
            });
        };

        if from == SessionState::Active {
            self.stop_monitors().await;
        }
        self.state = to;
        if let Some(session) = &mut self.session {
            session.state = to;
        }
        log::info!("Session {from} -> {to} ({trigger})");

        let persisted = self.persist();
        if to == SessionState::Active {
            self.start_monitors().await;
        }
        persisted.map(|()| to)
    }

    async fn start_monitors(&mut self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        if !self.role.is_monitored() || self.monitors.is_some() {
            return;
        }

        let policy = SessionPolicy::resolve(&self.classification, self.policy_override.as_ref());
        let guard = EnforcementGuard::new(
            self.device_id.clone(),
            session_id,
            Arc::clone(&self.buffer),
            Arc::clone(&self.devices.overlay),
            &self.enforcement,
        )
        .into_handle();

        if policy.always_on_lock {
            if let Err(e) = guard.lock().await.lock().await {
                log::error!("Always-on lock failed: {e}");
            }
        }

        let reactor = spawn_reactor(
            Arc::clone(&guard),
            Arc::clone(&self.devices.focus),
            Duration::from_millis(self.enforcement.focus_poll_ms.max(10)),
        );
        let classification = ClassificationLoop::new(
            self.device_id.clone(),
            session_id,
            policy,
            self.devices.clone(),
            Arc::clone(&self.buffer),
            Arc::clone(&guard),
        )
        .spawn();

        log::info!("Monitoring started for session {session_id}");
        self.monitors = Some(Monitors {
            guard,
            classification,
            reactor,
        });
    }

    /// Cancel both loops, then release any lock. Never fails.
    async fn stop_monitors(&mut self) {
        let Some(monitors) = self.monitors.take() else {
            return;
        };
        monitors.classification.abort();
        monitors.reactor.abort();
        // Wait for the aborts so neither task still holds the guard
        let _ = monitors.classification.await;
        let _ = monitors.reactor.await;

        if let Err(e) = monitors.guard.lock().await.release().await {
            log::error!("Failed to record lock release: {e}");
        }
        log::info!("Monitoring stopped");
    }

    /// Apply a pushed command
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for a command the current state does not
    /// accept or that names another session; state is unchanged
    pub async fn apply_command(&mut self, command: &PushCommand) -> CoreResult<SessionState> {
        if command.command == CommandKind::Start {
            return self.start(command).await;
        }

        if self.session_id() != Some(command.session_id) {
            log::warn!(
                "Rejected {} for unknown session {}",
                command.command,
                command.session_id
            );
            return Err(CoreError::InvalidTransition {
                from: self.state,
                trigger: format!("{} for session {}", command.command, command.session_id),
            });
        }

        let state = self.transition(Trigger::Command(command.command)).await?;
        match state {
            SessionState::Finalizing => self.request_finalize().await,
            SessionState::Idle => {
                self.session = None;
                self.policy_override = None;
            }
            _ => {}
        }
        Ok(state)
    }

    async fn start(&mut self, command: &PushCommand) -> CoreResult<SessionState> {
        if next_state(self.state, Trigger::Command(CommandKind::Start)).is_none() {
            return self.transition(Trigger::Command(CommandKind::Start)).await;
        }

        let session = Session::new(command.session_id, self.role, self.device_id.clone());
        self.db().insert_session(&session)?;
        self.session = Some(session);
        self.policy_override.clone_from(&command.policy);

        self.transition(Trigger::Command(CommandKind::Start)).await?;
        self.transition(Trigger::Joined).await
    }

    async fn request_finalize(&self) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        if self
            .sync_requests
            .send(SyncRequest::Finalize { session_id })
            .await
            .is_err()
        {
            log::error!("Sync engine gone, finalize of {session_id} stays pending");
        }
    }

    /// Complete `Finalizing` once the sync engine settled the handshake
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if no finalize is pending for the session
    pub async fn on_finalize_outcome(
        &mut self,
        session_id: Uuid,
        confirmed: bool,
    ) -> CoreResult<SessionState> {
        if self.session_id() != Some(session_id) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                trigger: format!("finalize outcome for session {session_id}"),
            });
        }
        if let Some(session) = &mut self.session {
            session.finalize_confirmed = confirmed;
        }
        let state = self.transition(Trigger::FinalizeSettled).await?;
        self.db().set_finalize_confirmed(session_id, confirmed)?;
        if !confirmed {
            log::warn!("Session {session_id} finalized locally, backend did not confirm");
        }
        Ok(state)
    }

    /// Tear down monitoring when platform permissions go away.
    /// Returns `false` if there was nothing to tear down.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the new state cannot be persisted
    pub async fn on_permission_revoked(&mut self) -> CoreResult<bool> {
        if next_state(self.state, Trigger::PermissionRevoked).is_none() {
            return Ok(false);
        }
        log::warn!("{}", CoreError::PermissionRevoked);
        self.transition(Trigger::PermissionRevoked).await?;
        self.session = None;
        Ok(true)
    }

    /// Drop to `Idle` and keep only the emergency path
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` outside `Active` and `Paused`
    pub async fn enter_emergency_only(&mut self) -> CoreResult<SessionState> {
        let state = self.transition(Trigger::EmergencyOnly).await?;
        self.session = None;
        Ok(state)
    }

    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the flag cannot be persisted
    pub fn set_sync_degraded(&mut self, degraded: bool) -> CoreResult<()> {
        if self.sync_degraded != degraded {
            self.sync_degraded = degraded;
            log::warn!("Sync degraded: {degraded}");
            self.persist()?;
        }
        Ok(())
    }

    /// Route a message from the sync side
    ///
    /// # Errors
    ///
    /// Propagates the error of the resulting transition
    pub async fn handle(&mut self, message: ControllerMessage) -> CoreResult<()> {
        match message {
            ControllerMessage::Command(command) => {
                self.apply_command(&command).await?;
            }
            ControllerMessage::EmergencyAcknowledged { request_id, at } => {
                self.emergency.acknowledge(request_id, at);
            }
            ControllerMessage::EmergencyUndeliverable { request_id, reason } => {
                self.emergency.mark_undeliverable(request_id, &reason);
            }
            ControllerMessage::FinalizeOutcome {
                session_id,
                confirmed,
            } => {
                self.on_finalize_outcome(session_id, confirmed).await?;
            }
            ControllerMessage::SyncDegraded(reason) => {
                log::warn!("{reason}");
                self.set_sync_degraded(true)?;
            }
            ControllerMessage::AuthExpired => {
                if !self.auth_expired {
                    log::warn!("{}", CoreError::AuthExpired);
                }
                self.auth_expired = true;
            }
            ControllerMessage::AuthRestored => {
                if self.auth_expired {
                    log::info!("Credentials accepted again");
                }
                self.auth_expired = false;
            }
        }
        Ok(())
    }

    /// Load persisted state after a restart. A restored `Active` session
    /// restarts its loops; an interrupted finalize is requested again.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the snapshot cannot be read
    pub async fn restore(&mut self) -> CoreResult<SessionState> {
        let Some((snapshot, saved_at)) = self.db().load_controller_state()? else {
            return Ok(self.state);
        };
        log::info!("Restoring session state {} from {saved_at}", snapshot.state);

        self.sync_degraded = snapshot.sync_degraded;
        self.session = match snapshot.session_id {
            Some(id) => self.db().get_session(id)?,
            None => None,
        };
        self.state = if self.session.is_some() || !snapshot.state.is_live() {
            snapshot.state
        } else {
            SessionState::Idle
        };

        match self.state {
            // The join never completed
            SessionState::Joining => {
                self.state = SessionState::Idle;
                self.persist()?;
                self.session = None;
            }
            SessionState::Active => self.start_monitors().await,
            SessionState::Finalizing => self.request_finalize().await,
            _ => {}
        }
        Ok(self.state)
    }

    /// Stop monitoring without changing state, for process shutdown
    pub async fn shutdown(&mut self) {
        self.stop_monitors().await;
    }
}
