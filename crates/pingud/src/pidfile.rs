//! Single-instance guard
//!
//! The pidfile is written at startup and removed when the guard drops. A
//! pidfile naming a live process stops a second instance from starting.

use crate::error::{PinguError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owned pidfile, removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for this process
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_pid(path, std::process::id())
    }

    fn create_with_pid(path: impl AsRef<Path>, pid: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(existing) = read_pid(&path) {
            if existing as u32 != pid && process_alive(existing) {
                return Err(PinguError::AlreadyRunning(existing));
            }
            warn!(path = %path.display(), pid = existing, "Removing stale pidfile");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", pid))?;
        debug!(path = %path.display(), pid, "Wrote pidfile");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pidfile");
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

fn process_alive(pid: i32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("pingu.pid");
        {
            let pidfile = PidFile::create(&path).unwrap();
            let content = fs::read_to_string(pidfile.path()).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pingu.pid");
        // pid 1 always exists
        fs::write(&path, "1\n").unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert!(matches!(err, PinguError::AlreadyRunning(1)));
        assert!(path.exists());
    }

    #[test]
    fn test_replaces_stale_pidfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pingu.pid");
        fs::write(&path, "garbage").unwrap();
        let pidfile = PidFile::create_with_pid(&path, 4242).unwrap();
        assert_eq!(fs::read_to_string(pidfile.path()).unwrap(), "4242\n");
    }
}
