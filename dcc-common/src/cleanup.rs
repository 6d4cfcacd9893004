//! Process-wide registry of files to delete on exit.
//!
//! Temp files and the state file are registered as they are created. Normal
//! exit paths remove them through their owners; the signal handler calls
//! [`cleanup_all`] so an interrupted build leaves nothing behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{trace, warn};

fn registry() -> MutexGuard<'static, Vec<PathBuf>> {
    static PATHS: OnceLock<Mutex<Vec<PathBuf>>> = OnceLock::new();
    PATHS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remember `path` for removal at exit.
pub fn register(path: impl Into<PathBuf>) {
    let path = path.into();
    let mut paths = registry();
    if !paths.contains(&path) {
        trace!("registered {} for cleanup", path.display());
        paths.push(path);
    }
}

/// Forget `path`, e.g. after its owner removed it.
pub fn unregister(path: &Path) {
    registry().retain(|p| p != path);
}

/// Whether `path` is currently registered.
pub fn is_registered(path: &Path) -> bool {
    registry().iter().any(|p| p == path)
}

/// Create an empty temp file named `<prefix>XXXXXX<suffix>` in the system
/// temp directory and register it.
pub fn make_temp_file(prefix: &str, suffix: &str) -> io::Result<PathBuf> {
    let path = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?
        .into_temp_path()
        .keep()
        .map_err(|e| e.error)?;
    register(&path);
    Ok(path)
}

/// Delete one registered file now and forget it.
pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => trace!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
    unregister(path);
}

/// Remove every registered file. Missing files are not an error.
pub fn cleanup_all() {
    let paths = std::mem::take(&mut *registry());
    for path in paths.iter().rev() {
        match fs::remove_file(path) {
            Ok(()) => trace!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", path.display(), e),
        }
    }
}
