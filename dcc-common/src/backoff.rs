//! Host reputation (backoff).
//!
//! After a remote failure a marker file is written for the host; its mtime
//! is the failure time. While the marker is younger than the backoff period
//! the host is left out of selection. A successful compile removes it.

use crate::hosts::{HostDefinition, HostRegistry};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Per-host failure markers under the lock directory.
#[derive(Debug, Clone)]
pub struct ReputationTracker {
    dir: PathBuf,
    period: Duration,
}

impl ReputationTracker {
    pub fn new(dir: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            dir: dir.into(),
            period,
        }
    }

    /// False when `DISTCC_BACKOFF_PERIOD=0`; every operation is then a no-op.
    pub fn is_enabled(&self) -> bool {
        !self.period.is_zero()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Marker file for `host`.
    pub fn marker_path(&self, host: &HostDefinition) -> PathBuf {
        self.dir.join(format!("backoff_{}", host.lock_key()))
    }

    /// Record a failure on `host` now.
    pub fn mark_disliked(&self, host: &HostDefinition) {
        if !self.is_enabled() {
            return;
        }
        let path = self.marker_path(host);
        match touch(&self.dir, &path) {
            Ok(()) => info!("marking {} as disliked for {:?}", host, self.period),
            Err(e) => warn!("failed to mark {} as disliked: {}", host, e),
        }
    }

    /// Clear any failure record for `host`.
    pub fn mark_enjoyed(&self, host: &HostDefinition) {
        if !self.is_enabled() {
            return;
        }
        match fs::remove_file(self.marker_path(host)) {
            Ok(()) => debug!("{} is back in favour", host),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to clear backoff for {}: {}", host, e),
        }
    }

    pub fn is_in_backoff(&self, host: &HostDefinition) -> bool {
        self.is_in_backoff_at(host, SystemTime::now())
    }

    /// Whether `host` failed less than one period before `now`.
    pub fn is_in_backoff_at(&self, host: &HostDefinition, now: SystemTime) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let path = self.marker_path(host);
        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                warn!("failed to stat {}: {}", path.display(), e);
                return false;
            }
        };
        match now.duration_since(mtime) {
            Ok(age) => age < self.period,
            // Marker from the future (clock skew): still counts.
            Err(_) => true,
        }
    }

    /// Hosts not currently in backoff.
    pub fn remove_disliked(&self, registry: &HostRegistry) -> HostRegistry {
        if !self.is_enabled() {
            return registry.clone();
        }
        registry.filter(|host| {
            let disliked = self.is_in_backoff(host);
            if disliked {
                info!("skipping {} during backoff", host);
            }
            !disliked
        })
    }
}

fn touch(dir: &Path, path: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.set_modified(SystemTime::now())
}
