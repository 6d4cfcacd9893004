//! Slot locks.
//!
//! A slot lock is an advisory exclusive lock on a file named after the lock
//! kind, the host identity and the slot index. Locks are shared between all
//! client processes on the machine; the lock file itself is never removed.

use crate::errors::DccError;
use crate::hosts::HostDefinition;
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Kind of resource a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// A compile (or preprocess) slot.
    Cpu,
}

impl LockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Cpu => "cpu",
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Someone else holds the lock and we asked not to wait.
    #[error("{0} is busy")]
    Busy(String),

    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy(_))
    }
}

impl From<LockError> for DccError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(_) => DccError::Busy,
            LockError::Io { path, source } => DccError::io_path("lock", &path, source),
        }
    }
}

/// Capability to take exclusive slot locks.
pub trait LockProvider {
    fn acquire(
        &self,
        kind: LockKind,
        host: &HostDefinition,
        slot: u32,
        blocking: bool,
    ) -> Result<SlotLock, LockError>;
}

/// Held lock on one (kind, host, slot). Released on drop.
pub struct SlotLock {
    name: String,
    slot: u32,
    file: Option<File>,
}

impl SlotLock {
    /// A lock with no backing file, for providers that track locks in
    /// memory.
    pub fn detached(name: impl Into<String>, slot: u32) -> Self {
        Self {
            name: name.into(),
            slot,
            file: None,
        }
    }

    /// Lock name, e.g. `cpu_localhost_0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Release now. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!("failed to unlock {}: {}", self.name, e);
            } else {
                trace!("released {}", self.name);
            }
        }
    }
}

impl fmt::Debug for SlotLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLock")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("held", &self.file.is_some())
            .finish()
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Name of the lock file for `kind` on `host`, slot `slot`.
pub fn lock_name(kind: LockKind, host: &HostDefinition, slot: u32) -> String {
    format!("{}_{}_{}", kind.as_str(), host.lock_key(), slot)
}

/// File-backed locks under the lock directory.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

impl FileLockProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open(&self, path: &Path) -> io::Result<File> {
        match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
        {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir)?;
                OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(path)
            }
            other => other,
        }
    }
}

impl LockProvider for FileLockProvider {
    fn acquire(
        &self,
        kind: LockKind,
        host: &HostDefinition,
        slot: u32,
        blocking: bool,
    ) -> Result<SlotLock, LockError> {
        let name = lock_name(kind, host, slot);
        let path = self.dir.join(&name);
        let file = self.open(&path).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;

        let locked = if blocking {
            file.lock_exclusive()
        } else {
            file.try_lock_exclusive()
        };
        match locked {
            Ok(()) => {
                debug!("got {name}");
                Ok(SlotLock {
                    name,
                    slot,
                    file: Some(file),
                })
            }
            Err(e) if is_contended(&e) => {
                trace!("{name} is busy");
                Err(LockError::Busy(name))
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
