use chrono::Utc;
use classguard_integrations::{BackendError, CommandSource, PushCommand};
use classguard_storage::{Database, ReceivedCommand};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{backoff_delay, ControllerMessage};
use crate::config::SyncConfig;
use crate::error::CoreResult;

/// Filters repeated deliveries of the same command id.
///
/// Recent ids live in an LRU cache seeded from the persisted ledger, so a
/// redelivery after restart is still caught.
pub struct CommandDeduper {
    db: Arc<Database>,
    recent: LruCache<String, ()>,
    capacity: usize,
}

impl CommandDeduper {
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the ledger cannot be read
    pub fn new(db: Arc<Database>, capacity: usize) -> CoreResult<Self> {
        let capacity = capacity.max(1);
        let mut recent = LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));
        // Oldest first, so the newest end up most recently used
        for id in db.recent_command_ids(capacity)?.into_iter().rev() {
            recent.put(id, ());
        }
        Ok(Self {
            db,
            recent,
            capacity,
        })
    }

    #[must_use]
    pub fn is_new(&self, command_id: &str) -> bool {
        !self.recent.contains(command_id)
    }

    /// Remember a command once it was handed to the controller
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the ledger write fails
    pub fn record(&mut self, command: &PushCommand) -> CoreResult<()> {
        self.db.record_command(&ReceivedCommand {
            command_id: command.command_id.clone(),
            session_id: command.session_id,
            command: command.command.to_string(),
            received_at: Utc::now(),
        })?;
        self.recent.put(command.command_id.clone(), ());
        Ok(())
    }

    /// Trim the persisted ledger to a few times the cache size
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if the delete fails
    pub fn prune(&self) -> CoreResult<usize> {
        Ok(self.db.prune_commands(self.capacity * 4)?)
    }
}

fn set_online(online: &watch::Sender<bool>, value: bool) {
    online.send_if_modified(|current| {
        let changed = *current != value;
        *current = value;
        changed
    });
}

/// Long-poll the push channel and forward new commands in arrival order.
///
/// The poll doubles as the connectivity probe: a transport failure marks the
/// device offline, the next answered poll marks it online again.
#[must_use]
pub fn spawn_push_listener(
    source: Arc<dyn CommandSource>,
    mut deduper: CommandDeduper,
    messages: mpsc::Sender<ControllerMessage>,
    online: watch::Sender<bool>,
    config: &SyncConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let base = Duration::from_millis(config.backoff_base_ms);
    let max = Duration::from_millis(config.backoff_max_ms);

    tokio::spawn(async move {
        let mut failures = 0u32;
        let mut auth_suspended = false;
        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = source.poll() => polled,
            };

            let commands = match polled {
                Ok(commands) => {
                    failures = 0;
                    set_online(&online, true);
                    if std::mem::take(&mut auth_suspended)
                        && messages.send(ControllerMessage::AuthRestored).await.is_err()
                    {
                        break;
                    }
                    commands
                }
                Err(e) => {
                    failures += 1;
                    let delay = match &e {
                        BackendError::AuthExpired { .. } => {
                            auth_suspended = true;
                            if messages.send(ControllerMessage::AuthExpired).await.is_err() {
                                break;
                            }
                            max
                        }
                        BackendError::Transient(_) => {
                            set_online(&online, false);
                            backoff_delay(base, max, failures)
                        }
                        BackendError::Protocol(_) => backoff_delay(base, max, failures),
                    };
                    log::warn!("Push poll failed ({e}), retrying in {}ms", delay.as_millis());
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if commands.is_empty() {
                continue;
            }

            let mut received = Vec::with_capacity(commands.len());
            for command in commands {
                received.push(command.command_id.clone());
                if !deduper.is_new(&command.command_id) {
                    log::debug!("Ignoring repeated command {}", command.command_id);
                    continue;
                }
                log::info!(
                    "Received {} for session {} ({})",
                    command.command,
                    command.session_id,
                    command.command_id
                );
                if messages
                    .send(ControllerMessage::Command(command.clone()))
                    .await
                    .is_err()
                {
                    return;
                }
                if let Err(e) = deduper.record(&command) {
                    log::warn!("Failed to record command {}: {e}", command.command_id);
                }
            }

            if let Err(e) = source.acknowledge(&received).await {
                log::warn!("Failed to acknowledge commands: {e}");
            }
            if let Err(e) = deduper.prune() {
                log::debug!("Command ledger prune failed: {e}");
            }
        }
        log::debug!("Push listener stopped");
    })
}
