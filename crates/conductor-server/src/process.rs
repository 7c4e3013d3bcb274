//! Single-instance guard.
//!
//! A PID file in the user cache directory records the running relay. A new
//! relay stops whatever process the file names before taking over the file.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const PID_FILE: &str = "conductor.pid";

/// Holds the PID file for as long as this process runs.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    pid: u32,
}

impl InstanceGuard {
    /// `<cache dir>/conductor/conductor.pid`.
    pub fn default_path() -> io::Result<PathBuf> {
        let cache = dirs::cache_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no cache directory"))?;
        Ok(cache.join("conductor").join(PID_FILE))
    }

    /// Stop the instance recorded at `path`, if any, then record ours.
    pub async fn acquire(path: PathBuf) -> io::Result<Self> {
        let pid = std::process::id();

        if let Some(previous) = read_pid(&path)? {
            if previous != pid {
                terminate(previous).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, pid.to_string()).await?;
        debug!(path = %path.display(), pid, "recorded instance PID");

        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Another instance may have taken over the file since.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// PID recorded at `path`. A missing or unparsable file counts as none.
fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn terminate(pid: u32) {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/F"]);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("kill");
        cmd.arg(pid.to_string());
        cmd
    };

    match cmd.stdout(Stdio::null()).stderr(Stdio::null()).status().await {
        Ok(status) if status.success() => info!(pid, "stopped previous conductor instance"),
        Ok(_) => debug!(pid, "previous conductor instance is not running"),
        Err(e) => warn!(pid, error = %e, "could not stop previous conductor instance"),
    }
}
