//! Device collaborators: screen capture, classifier, focus observer, overlay
//! surface and permission probe.
//!
//! The core only sees these traits. Concrete adapters drive external
//! commands or an HTTP classifier so the platform-specific parts stay outside
//! the process.

mod command;
mod http_classifier;

pub use command::{
    CommandCapture, CommandFocusObserver, CommandOverlay, CommandPermissionProbe,
};
pub use http_classifier::HttpClassifier;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classguard_integrations::ProximitySource;
use std::sync::Arc;

use crate::config::{CoreConfig, DeviceCommands};

/// Captured screen image
#[derive(Debug, Clone)]
pub struct ScreenImage {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// Raw classifier output
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Category label as reported by the model
    pub label: String,
    pub confidence: f32,
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<ScreenImage>;
}

/// Opaque image classifier. Same image, same answer.
#[async_trait]
pub trait ScreenClassifier: Send + Sync {
    async fn classify(&self, image: &ScreenImage) -> Result<Classification>;
}

/// Reports whether the restricted surface holds foreground focus
#[async_trait]
pub trait FocusObserver: Send + Sync {
    async fn is_foreground(&self) -> Result<bool>;
}

/// The locked overlay
#[async_trait]
pub trait OverlaySurface: Send + Sync {
    async fn show(&self) -> Result<()>;
    async fn reassert(&self) -> Result<()>;
    async fn hide(&self) -> Result<()>;
}

/// Platform permissions needed to monitor and lock
#[async_trait]
pub trait PermissionProbe: Send + Sync {
    async fn granted(&self) -> Result<bool>;
}

/// Stand-in for a collaborator that is not configured
#[derive(Debug, Clone)]
pub struct Unconfigured(pub &'static str);

#[async_trait]
impl ScreenCapture for Unconfigured {
    async fn capture(&self) -> Result<ScreenImage> {
        anyhow::bail!("{} is not configured", self.0)
    }
}

#[async_trait]
impl ScreenClassifier for Unconfigured {
    async fn classify(&self, _image: &ScreenImage) -> Result<Classification> {
        anyhow::bail!("{} is not configured", self.0)
    }
}

#[async_trait]
impl FocusObserver for Unconfigured {
    async fn is_foreground(&self) -> Result<bool> {
        anyhow::bail!("{} is not configured", self.0)
    }
}

#[async_trait]
impl OverlaySurface for Unconfigured {
    async fn show(&self) -> Result<()> {
        log::warn!("{} is not configured, cannot show overlay", self.0);
        Ok(())
    }

    async fn reassert(&self) -> Result<()> {
        Ok(())
    }

    async fn hide(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PermissionProbe for Unconfigured {
    /// Without a probe, permissions are assumed granted
    async fn granted(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Every collaborator the session needs
#[derive(Clone)]
pub struct DeviceSet {
    pub capture: Arc<dyn ScreenCapture>,
    pub classifier: Arc<dyn ScreenClassifier>,
    pub focus: Arc<dyn FocusObserver>,
    pub overlay: Arc<dyn OverlaySurface>,
    pub permissions: Arc<dyn PermissionProbe>,
    pub proximity: Option<Arc<dyn ProximitySource>>,
}

impl DeviceSet {
    /// Build adapters from config. Returns the set plus the names of the
    /// collaborators left unconfigured.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be created
    pub fn from_config(
        config: &CoreConfig,
        proximity: Option<Arc<dyn ProximitySource>>,
    ) -> Result<(Self, Vec<&'static str>)> {
        let commands: &DeviceCommands = &config.devices;
        let mut missing = Vec::new();

        let capture: Arc<dyn ScreenCapture> = match &commands.capture {
            Some(argv) => Arc::new(CommandCapture::new(argv.clone())),
            None => {
                missing.push("screen capture");
                Arc::new(Unconfigured("screen capture"))
            }
        };

        let classifier: Arc<dyn ScreenClassifier> = match &commands.classifier_url {
            Some(url) => Arc::new(HttpClassifier::new(
                url,
                std::time::Duration::from_secs(config.backend.request_timeout_secs),
            )?),
            None => {
                missing.push("classifier");
                Arc::new(Unconfigured("classifier"))
            }
        };

        let focus: Arc<dyn FocusObserver> = match &commands.focus {
            Some(argv) => Arc::new(CommandFocusObserver::new(argv.clone())),
            None => {
                missing.push("focus observer");
                Arc::new(Unconfigured("focus observer"))
            }
        };

        let overlay: Arc<dyn OverlaySurface> = match &commands.overlay_show {
            Some(show) => Arc::new(CommandOverlay::new(
                show.clone(),
                commands.overlay_reassert.clone(),
                commands.overlay_hide.clone(),
            )),
            None => {
                missing.push("overlay");
                Arc::new(Unconfigured("overlay"))
            }
        };

        let permissions: Arc<dyn PermissionProbe> = match &commands.permission {
            Some(argv) => Arc::new(CommandPermissionProbe::new(argv.clone())),
            None => Arc::new(Unconfigured("permission probe")),
        };

        Ok((
            Self {
                capture,
                classifier,
                focus,
                overlay,
                permissions,
                proximity,
            },
            missing,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_devices_are_reported() {
        let (_, missing) = DeviceSet::from_config(&CoreConfig::default(), None).unwrap();
        assert_eq!(
            missing,
            vec!["screen capture", "classifier", "focus observer", "overlay"]
        );
    }

    #[tokio::test]
    async fn test_unconfigured_capture_errors_but_overlay_does_not() {
        let stub = Unconfigured("test");
        assert!(ScreenCapture::capture(&stub).await.is_err());
        assert!(OverlaySurface::show(&stub).await.is_ok());
        assert!(PermissionProbe::granted(&stub).await.unwrap());
    }
}
