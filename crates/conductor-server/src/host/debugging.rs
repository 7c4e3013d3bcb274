//! Remote-debugging marker file.
//!
//! The host only exposes its debugger endpoint when a
//! `.cef-enable-remote-debugging` file exists in its install directory. The
//! setting takes effect the next time the host starts.

use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

const MARKER_FILE: &str = ".cef-enable-remote-debugging";

/// Platform-specific location of the marker file.
pub fn marker_path() -> io::Result<PathBuf> {
    #[cfg(windows)]
    {
        Ok(PathBuf::from(r"C:\Program Files (x86)\Steam").join(MARKER_FILE))
    }

    #[cfg(not(windows))]
    {
        let home = dirs::home_dir()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;

        #[cfg(target_os = "macos")]
        let steam_dir = home.join("Library/Application Support/Steam");
        #[cfg(not(target_os = "macos"))]
        let steam_dir = home.join(".steam/steam");

        Ok(steam_dir.join(MARKER_FILE))
    }
}

/// Create the marker at the platform location.
pub fn enable_remote_debugging() -> io::Result<PathBuf> {
    let path = marker_path()?;
    ensure_marker(&path)?;
    Ok(path)
}

/// Create `path` if it does not exist. Returns whether it was created.
pub fn ensure_marker(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = parent {
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Steam directory {} does not exist", dir.display()),
            ));
        }
    }
    std::fs::File::create(path)?;
    info!(path = %path.display(), "enabled remote debugging, restart Steam if it is running");
    Ok(true)
}
