use anyhow::{Context, Result};
use classguard_integrations::{
    BackendClient, CommandSource, HubClient, IngestionBackend, ProximitySource, PushClient,
};
use classguard_storage::{Database, RecoveryReport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoreConfig;
use crate::device::DeviceSet;
use crate::emergency::EmergencyChannel;
use crate::event_buffer::EventBuffer;

/// Overall health, reported through IPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    #[default]
    Healthy,
    Degraded { reasons: Vec<String> },
}

impl SystemStatus {
    pub fn degrade(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Degraded: {reason}");
        match self {
            Self::Healthy => {
                *self = Self::Degraded {
                    reasons: vec![reason],
                };
            }
            Self::Degraded { reasons } => reasons.push(reason),
        }
    }

    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded { reasons } => write!(f, "degraded ({})", reasons.join("; ")),
        }
    }
}

/// Remote endpoints; `None` when not configured
#[derive(Default)]
pub struct Clients {
    pub backend: Option<Arc<dyn IngestionBackend>>,
    pub push: Option<Arc<dyn CommandSource>>,
    pub hub: Option<Arc<dyn ProximitySource>>,
}

/// Everything the daemon shares, built once at startup
pub struct AppContext {
    pub config: CoreConfig,
    pub data_dir: PathBuf,
    pub db: Arc<Database>,
    pub buffer: Arc<EventBuffer>,
    pub emergency: Arc<EmergencyChannel>,
    pub devices: DeviceSet,
    pub clients: Clients,
    pub status: SystemStatus,
}

impl AppContext {
    /// Staged init. Only storage is essential; every later stage that fails
    /// leaves the system `Degraded` and keeps going.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or recreated
    pub fn init(config: CoreConfig, data_dir: &Path) -> Result<Self> {
        let mut status = SystemStatus::Healthy;

        let db = Self::open_storage(data_dir, &mut status)?;
        let buffer = Arc::new(EventBuffer::new(Arc::clone(&db), &config.buffer));
        Self::recover_buffer(&buffer, &mut status);

        let emergency = Arc::new(EmergencyChannel::new(
            config.device.device_id.clone(),
            Arc::clone(&buffer),
            Duration::from_secs(config.emergency.cooldown_secs),
        ));
        if let Err(e) = emergency.restore_pending() {
            status.degrade(format!("pending help requests not restored: {e}"));
        }

        let clients = Self::build_clients(&config, &mut status);
        let devices = Self::build_devices(&config, clients.hub.clone(), &mut status)?;

        log::info!("Context ready: {status}");
        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            db,
            buffer,
            emergency,
            devices,
            clients,
            status,
        })
    }

    fn open_storage(data_dir: &Path, status: &mut SystemStatus) -> Result<Arc<Database>> {
        let path = data_dir.join("classguard.db");
        let (db, report) = Database::open_or_recover(Some(path.clone()))
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        if let Some(report) = report {
            Self::report_recovery(&report, status);
        }
        Ok(Arc::new(db))
    }

    fn report_recovery(report: &RecoveryReport, status: &mut SystemStatus) {
        log::error!(
            "Database was damaged and moved to {}",
            report.quarantined_file.display()
        );
        for (partition, count) in &report.salvaged {
            log::info!("Salvaged {count} {partition} entries");
        }
        for partition in report.damaged_partitions() {
            status.degrade(format!("{partition} partition lost entries in recovery"));
        }
    }

    fn recover_buffer(buffer: &EventBuffer, status: &mut SystemStatus) {
        match buffer.recover() {
            Ok(corrupt) => {
                for error in corrupt {
                    status.degrade(error.to_string());
                }
            }
            Err(e) => status.degrade(format!("outbox recovery failed: {e}")),
        }
    }

    fn build_clients(config: &CoreConfig, status: &mut SystemStatus) -> Clients {
        let mut clients = Clients::default();
        let device_id = config.device.device_id.clone();

        match &config.backend.base_url {
            Some(base_url) => {
                let timeout = Duration::from_secs(config.backend.request_timeout_secs);
                match BackendClient::new(base_url, config.backend.api_token.clone(), timeout) {
                    Ok(client) => clients.backend = Some(Arc::new(client)),
                    Err(e) => status.degrade(format!("backend client: {e}")),
                }
                match PushClient::new(
                    base_url,
                    config.backend.api_token.clone(),
                    device_id.clone(),
                    config.backend.push_secret.clone(),
                    Duration::from_secs(config.backend.push_poll_timeout_secs),
                ) {
                    Ok(client) => clients.push = Some(Arc::new(client)),
                    Err(e) => status.degrade(format!("push client: {e}")),
                }
            }
            None => status.degrade("backend not configured, events stay buffered"),
        }

        if let Some(hub) = &config.hub {
            match HubClient::new(
                &hub.base_url,
                hub.shared_secret.clone(),
                device_id,
                Duration::from_millis(hub.poll_timeout_ms),
            ) {
                Ok(client) => clients.hub = Some(Arc::new(client)),
                // The hub is optional; without it proximity is never consulted
                Err(e) => log::warn!("Hub client unavailable: {e}"),
            }
        }
        clients
    }

    fn build_devices(
        config: &CoreConfig,
        proximity: Option<Arc<dyn ProximitySource>>,
        status: &mut SystemStatus,
    ) -> Result<DeviceSet> {
        let (devices, missing) = DeviceSet::from_config(config, proximity)
            .context("Failed to build device collaborators")?;
        if !missing.is_empty() && config.device.role.is_monitored() {
            status.degrade(format!("not configured: {}", missing.join(", ")));
        }
        Ok(devices)
    }
}
