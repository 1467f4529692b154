use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::process::Output;
use tokio::process::Command;

use super::{FocusObserver, OverlaySurface, PermissionProbe, ScreenCapture, ScreenImage};

async fn run(argv: &[String]) -> Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Empty device command"))?;
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run {program}"))
}

async fn run_checked(argv: &[String]) -> Result<Output> {
    let output = run(argv).await?;
    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            argv.first().map_or("", String::as_str),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Capture by running a command that writes the image to stdout
#[derive(Debug, Clone)]
pub struct CommandCapture {
    argv: Vec<String>,
}

impl CommandCapture {
    #[must_use]
    pub const fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self) -> Result<ScreenImage> {
        let output = run_checked(&self.argv).await?;
        if output.stdout.is_empty() {
            anyhow::bail!("Capture command produced no image");
        }
        Ok(ScreenImage {
            bytes: output.stdout,
            captured_at: Utc::now(),
        })
    }
}

/// Focus check by exit status: 0 means the surface is in the foreground
#[derive(Debug, Clone)]
pub struct CommandFocusObserver {
    argv: Vec<String>,
}

impl CommandFocusObserver {
    #[must_use]
    pub const fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl FocusObserver for CommandFocusObserver {
    async fn is_foreground(&self) -> Result<bool> {
        Ok(run(&self.argv).await?.status.success())
    }
}

/// Overlay driven by show/reassert/hide commands
#[derive(Debug, Clone)]
pub struct CommandOverlay {
    show: Vec<String>,
    reassert: Option<Vec<String>>,
    hide: Option<Vec<String>>,
}

impl CommandOverlay {
    #[must_use]
    pub const fn new(
        show: Vec<String>,
        reassert: Option<Vec<String>>,
        hide: Option<Vec<String>>,
    ) -> Self {
        Self {
            show,
            reassert,
            hide,
        }
    }
}

#[async_trait]
impl OverlaySurface for CommandOverlay {
    async fn show(&self) -> Result<()> {
        run_checked(&self.show).await?;
        Ok(())
    }

    /// Falls back to `show` when no separate raise command is set
    async fn reassert(&self) -> Result<()> {
        run_checked(self.reassert.as_ref().unwrap_or(&self.show)).await?;
        Ok(())
    }

    async fn hide(&self) -> Result<()> {
        if let Some(hide) = &self.hide {
            run_checked(hide).await?;
        }
        Ok(())
    }
}

/// Permission check by exit status
#[derive(Debug, Clone)]
pub struct CommandPermissionProbe {
    argv: Vec<String>,
}

impl CommandPermissionProbe {
    #[must_use]
    pub const fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl PermissionProbe for CommandPermissionProbe {
    async fn granted(&self) -> Result<bool> {
        Ok(run(&self.argv).await?.status.success())
    }
}
