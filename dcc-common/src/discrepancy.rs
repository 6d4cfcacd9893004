//! Discrepancy counter.
//!
//! A discrepancy is a compile that failed remotely but succeeded locally,
//! which with server-side preprocessing usually means the include server's
//! view of the file system went stale. The count is the byte length of a
//! file next to the include server's socket; incrementing appends one byte.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of `INCLUDE_SERVER_PORT` that the counter file replaces.
const SOCKET_SUFFIX: &str = "/socket";

/// Counter file name placed next to the socket.
const COUNTER_NAME: &str = "discrepancy_counter";

/// Shared counter of remote/local result mismatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscrepancyCounter {
    path: PathBuf,
    max: u32,
}

impl DiscrepancyCounter {
    /// Counter for the include server listening on `include_server_port`.
    ///
    /// Returns `None` when the port is not a `.../socket` path; there is
    /// then nothing to count against.
    pub fn from_include_server_port(include_server_port: &Path, max: u32) -> Option<Self> {
        let port = include_server_port.to_str()?;
        let Some(dir) = port.strip_suffix(SOCKET_SUFFIX) else {
            debug!("INCLUDE_SERVER_PORT {port} does not end in {SOCKET_SUFFIX}");
            return None;
        };
        Some(Self::at(PathBuf::from(format!("{dir}/{COUNTER_NAME}")), max))
    }

    pub fn at(path: impl Into<PathBuf>, max: u32) -> Self {
        Self {
            path: path.into(),
            max,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of discrepancies recorded so far. A missing file counts 0.
    pub fn count(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Whether server-side preprocessing should be abandoned.
    pub fn threshold_reached(&self) -> bool {
        self.count() >= u64::from(self.max)
    }

    /// Append one byte.
    ///
    /// Returns the file position after our write. Exactly one process sees
    /// the position equal to the threshold and logs the demotion warning.
    pub fn note(&self) -> io::Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(b"@")?;
        let position = file.stream_position()?;
        if position == u64::from(self.max) {
            warn!("now using plain distcc, possibly due to inconsistent file system changes during build");
        }
        Ok(position)
    }
}
