//! First-time device setup: config file, device identity and database

use anyhow::{Context, Result};
use classguard_core::config::CoreConfig;
use classguard_storage::{Database, Role};
use std::path::Path;

pub struct InitOptions {
    pub role: Option<Role>,
    pub backend_url: Option<String>,
    pub api_token: Option<String>,
}

/// Create or update the config and open the database once
///
/// # Errors
///
/// Returns an error if the config cannot be written or the database created
pub fn init_command(data_dir: &Path, options: InitOptions) -> Result<()> {
    println!("Initializing classguard...\n");

    println!("Step 1/2: Configuration");
    println!("{}", "-".repeat(40));
    let config_path = CoreConfig::default_path(data_dir);
    let config = apply_options(CoreConfig::load(&config_path)?, options);
    config.save(&config_path)?;
    println!("Device id: {}", config.device.device_id);
    println!("Role: {}", config.device.role);
    println!("Config written to: {}", config_path.display());

    println!("\nStep 2/2: Database Setup");
    println!("{}", "-".repeat(40));
    let db_path = data_dir.join("classguard.db");
    let db = Database::new(Some(db_path.clone()))
        .with_context(|| format!("Failed to create database at {}", db_path.display()))?;
    drop(db);
    println!("Database ready.");

    if config.backend.base_url.is_none() {
        println!("\nNo backend configured; events will stay buffered on this device.");
        println!("Re-run with --backend-url and --api-token to enable sync.");
    }
    println!("\nStart the agent with: classguard start");
    Ok(())
}

fn apply_options(mut config: CoreConfig, options: InitOptions) -> CoreConfig {
    if config.ensure_device_id() {
        log::info!("Generated device id {}", config.device.device_id);
    }
    if let Some(role) = options.role {
        config.device.role = role;
    }
    if options.backend_url.is_some() {
        config.backend.base_url = options.backend_url;
    }
    if let Some(token) = options.api_token {
        config.backend.api_token = token;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable_and_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        init_command(
            dir.path(),
            InitOptions {
                role: Some(Role::Teacher),
                backend_url: Some("https://api.example.test".to_string()),
                api_token: Some("token".to_string()),
            },
        )
        .unwrap();
        let first = CoreConfig::load(&CoreConfig::default_path(dir.path())).unwrap();
        assert_eq!(first.device.role, Role::Teacher);
        assert!(dir.path().join("classguard.db").exists());

        init_command(
            dir.path(),
            InitOptions {
                role: None,
                backend_url: None,
                api_token: None,
            },
        )
        .unwrap();
        let second = CoreConfig::load(&CoreConfig::default_path(dir.path())).unwrap();
        assert_eq!(second.device.device_id, first.device.device_id);
        assert_eq!(second.device.role, Role::Teacher);
        assert_eq!(
            second.backend.base_url.as_deref(),
            Some("https://api.example.test")
        );
    }
}
