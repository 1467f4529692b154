/// Configuration display
use anyhow::Result;
use classguard_core::config::CoreConfig;
use std::path::Path;

use super::helpers::mask_secret;

/// Effective configuration with secrets masked
fn redacted(mut config: CoreConfig) -> CoreConfig {
    config.backend.api_token = mask_secret(&config.backend.api_token);
    config.backend.push_secret = config.backend.push_secret.as_deref().map(mask_secret);
    if let Some(hub) = &mut config.hub {
        hub.shared_secret = mask_secret(&hub.shared_secret);
    }
    config
}

pub fn show_config(data_dir: &Path) -> Result<()> {
    let path = CoreConfig::default_path(data_dir);
    let config = CoreConfig::load(&path)?;

    println!("# {}", path.display());
    println!("{}", redacted(config).to_toml()?);
    Ok(())
}
