use anyhow::{Context, Result};
use classguard_storage::{CapacityPolicy, Category, Decision, RetryPolicy, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the local data directory for classguard.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("classguard");
    Ok(path)
}

/// Device-local configuration, read from `config.toml` in the data dir
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub hub: Option<HubConfig>,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub devices: DeviceCommands,
}

impl CoreConfig {
    #[must_use]
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.toml")
    }

    /// Load configuration; a missing file yields defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write configuration as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Assign a device id if none is set. Returns `true` when one was generated.
    pub fn ensure_device_id(&mut self) -> bool {
        if self.device.device_id.is_empty() {
            self.device.device_id = uuid::Uuid::new_v4().to_string();
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_token: String,
    /// HMAC secret for push command signatures; unset disables verification
    #[serde(default)]
    pub push_secret: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_push_poll_timeout_secs")]
    pub push_poll_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: String::new(),
            push_secret: None,
            request_timeout_secs: default_request_timeout_secs(),
            push_poll_timeout_secs: default_push_poll_timeout_secs(),
        }
    }
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_push_poll_timeout_secs() -> u64 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub base_url: String,
    pub shared_secret: String,
    #[serde(default = "default_hub_timeout_ms")]
    pub poll_timeout_ms: u64,
}

const fn default_hub_timeout_ms() -> u64 {
    1500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Category name to `allow` / `block`
    #[serde(default = "default_policy")]
    pub policy: BTreeMap<String, String>,
    #[serde(default)]
    pub always_on_lock: bool,
    #[serde(default = "default_true")]
    pub relax_when_away: bool,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            confidence_threshold: default_confidence_threshold(),
            policy: default_policy(),
            always_on_lock: false,
            relax_when_away: true,
        }
    }
}

pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_INTERVAL_SECS: u64 = 15;

impl ClassificationConfig {
    /// Capture interval clamped to the supported range
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS))
    }
}

const fn default_interval_secs() -> u64 {
    10
}

const fn default_confidence_threshold() -> f32 {
    0.6
}

const fn default_true() -> bool {
    true
}

fn default_policy() -> BTreeMap<String, String> {
    Category::ALL
        .iter()
        .map(|category| {
            let decision = match category {
                Category::Education | Category::Unknown => Decision::Allow,
                _ => Decision::Block,
            };
            (category.to_string(), decision.to_string().to_lowercase())
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_reassert_interval_secs")]
    pub reassert_interval_secs: u64,
    #[serde(default = "default_focus_poll_ms")]
    pub focus_poll_ms: u64,
    /// How often platform permissions are re-checked
    #[serde(default = "default_permission_poll_ms")]
    pub permission_poll_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            reassert_interval_secs: default_reassert_interval_secs(),
            focus_poll_ms: default_focus_poll_ms(),
            permission_poll_ms: default_permission_poll_ms(),
        }
    }
}

const fn default_grace_period_secs() -> u64 {
    10
}

const fn default_reassert_interval_secs() -> u64 {
    3
}

const fn default_focus_poll_ms() -> u64 {
    500
}

const fn default_permission_poll_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub attention_capacity: u32,
    pub enforcement_capacity: u32,
    pub emergency_capacity: u32,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retention_hours: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        let capacity = CapacityPolicy::default();
        let retry = RetryPolicy::default();
        Self {
            attention_capacity: capacity.attention,
            enforcement_capacity: capacity.enforcement,
            emergency_capacity: capacity.emergency,
            max_attempts: retry.max_attempts,
            retry_base_ms: u64::try_from(retry.base_delay.as_millis()).unwrap_or(1000),
            retry_max_ms: u64::try_from(retry.max_delay.as_millis()).unwrap_or(300_000),
            retention_hours: 72,
        }
    }
}

impl BufferConfig {
    #[must_use]
    pub const fn capacity(&self) -> CapacityPolicy {
        CapacityPolicy {
            attention: self.attention_capacity,
            enforcement: self.enforcement_capacity,
            emergency: self.emergency_capacity,
        }
    }

    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub finalize_attempts: u32,
    pub command_dedup_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_ms: 2000,
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
            finalize_attempts: 5,
            command_dedup_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub cooldown_secs: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self { cooldown_secs: 60 }
    }
}

/// Shell commands backing the device collaborators. Each is argv form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCommands {
    /// Prints a screen image on stdout
    pub capture: Option<Vec<String>>,
    /// Exits 0 while the restricted surface holds focus
    pub focus: Option<Vec<String>>,
    pub overlay_show: Option<Vec<String>>,
    pub overlay_reassert: Option<Vec<String>>,
    pub overlay_hide: Option<Vec<String>>,
    /// Exits 0 while screen capture and overlay permissions are granted
    pub permission: Option<Vec<String>>,
    /// Classification endpoint receiving the raw image
    pub classifier_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.classification.interval(), Duration::from_secs(10));
        assert_eq!(config.classification.policy["GAME"], "block");
        assert_eq!(config.classification.policy["EDUCATION"], "allow");
        assert_eq!(config.buffer.capacity().attention, 5000);
        assert_eq!(config.buffer.retry().max_attempts, 8);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.emergency.cooldown_secs, 60);
        assert!(config.hub.is_none());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = CoreConfig::parse(
            r#"
[device]
device_id = "tablet-07"
role = "teacher"

[classification]
interval_secs = 30

[sync]
batch_size = 10

[hub]
base_url = "http://hub.local"
shared_secret = "abc"
"#,
        )
        .unwrap();

        assert_eq!(config.device.device_id, "tablet-07");
        assert_eq!(config.device.role, Role::Teacher);
        // Clamped to the supported range
        assert_eq!(config.classification.interval(), Duration::from_secs(15));
        assert_eq!(config.classification.policy.len(), 6);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.finalize_attempts, 5);
        assert_eq!(config.hub.unwrap().poll_timeout_ms, 1500);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = CoreConfig::default_path(dir.path());
        let mut config = CoreConfig::default();
        assert!(config.ensure_device_id());
        assert!(!config.ensure_device_id());
        config.save(&path).unwrap();

        let loaded = CoreConfig::load(&path).unwrap();
        assert_eq!(loaded.device.device_id, config.device.device_id);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.device.device_id.is_empty());
    }
}
