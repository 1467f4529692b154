use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Pid file bookkeeping for the detached daemon
pub struct DaemonControl {
    pid_file: PathBuf,
}

impl DaemonControl {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            pid_file: data_dir.join("classguard.pid"),
        }
    }

    #[must_use]
    pub fn pid_path(&self) -> &Path {
        &self.pid_file
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written
    pub fn write_pid(&self, pid: u32) -> Result<()> {
        std::fs::write(&self.pid_file, pid.to_string())
            .with_context(|| format!("Failed to write {}", self.pid_file.display()))
    }

    /// Recorded pid, `None` without a pid file
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but does not hold a pid
    pub fn get_pid(&self) -> Result<Option<u32>> {
        if !self.pid_file.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.pid_file)?;
        let pid = contents
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Corrupt pid file {}", self.pid_file.display()))?;
        Ok(Some(pid))
    }

    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed
    pub fn remove_pid(&self) -> Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let control = DaemonControl::new(dir.path());
        assert_eq!(control.get_pid().unwrap(), None);

        control.write_pid(4242).unwrap();
        assert_eq!(control.get_pid().unwrap(), Some(4242));

        control.remove_pid().unwrap();
        assert!(!control.pid_path().exists());
        control.remove_pid().unwrap();
    }

    #[test]
    fn test_corrupt_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let control = DaemonControl::new(dir.path());
        std::fs::write(control.pid_path(), "not a pid").unwrap();
        assert!(control.get_pid().is_err());
    }
}
