//! Per-process phase snapshots for external monitors.
//!
//! Each client process keeps `<state_dir>/binstate_<pid>` up to date with
//! what it is doing: which phase, which source file, which host and slot.
//! Monitors poll the directory and decode the fixed-size records.
//!
//! Record layout (little-endian):
//!
//! | Offset | Size | Field                       |
//! |--------|------|-----------------------------|
//! | 0      | 8    | record size (296)           |
//! | 8      | 8    | magic                       |
//! | 16     | 8    | pid                         |
//! | 24     | 128  | source basename, NUL padded |
//! | 152    | 128  | host, NUL padded            |
//! | 280    | 4    | slot (i32, -1 = none)       |
//! | 284    | 4    | phase (i32)                 |
//! | 288    | 8    | reserved, zero              |

use crate::cleanup;
use crate::filename;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{trace, warn};

// ── Constants ──────────────────────────────────────────────────────────────

/// Identifies a snapshot record.
pub const STATE_MAGIC: u64 = 0x4449_4800;

/// Encoded record size in bytes.
pub const RECORD_SIZE: usize = 296;

/// Capacity of the file and host fields, including the terminating NUL.
pub const NAME_FIELD_LEN: usize = 128;

/// State file name prefix.
pub const STATE_PREFIX: &str = "binstate_";

/// What a client process is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Phase {
    Startup = 0,
    Blocked = 1,
    Compile = 2,
    Preprocess = 3,
    Connect = 4,
    Send = 5,
    Receive = 6,
    Done = 7,
}

impl Phase {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Phase::Startup,
            1 => Phase::Blocked,
            2 => Phase::Compile,
            3 => Phase::Preprocess,
            4 => Phase::Connect,
            5 => Phase::Send,
            6 => Phase::Receive,
            7 => Phase::Done,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Startup => "Startup",
            Phase::Blocked => "Blocked",
            Phase::Compile => "Compile",
            Phase::Preprocess => "Preprocess",
            Phase::Connect => "Connect",
            Phase::Send => "Send",
            Phase::Receive => "Receive",
            Phase::Done => "Done",
        }
    }
}

/// Which of the two snapshots a transition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTarget {
    Local,
    Remote,
    /// Whichever snapshot was selected last.
    Unknown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("record is {actual} bytes, expected {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("bad magic {0:#x}")]
    BadMagic(u64),

    #[error("record declares size {0}")]
    UnknownSize(u64),

    #[error("unknown phase {0}")]
    UnknownPhase(i32),
}

/// One decoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub pid: u32,
    pub phase: Phase,
    pub file: String,
    pub host: String,
    pub slot: i32,
}

impl PhaseSnapshot {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            phase: Phase::Startup,
            file: String::new(),
            host: String::new(),
            slot: -1,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..8].copy_from_slice(&(RECORD_SIZE as u64).to_le_bytes());
        buf[8..16].copy_from_slice(&STATE_MAGIC.to_le_bytes());
        buf[16..24].copy_from_slice(&u64::from(self.pid).to_le_bytes());
        put_name(&mut buf[24..152], &self.file);
        put_name(&mut buf[152..280], &self.host);
        buf[280..284].copy_from_slice(&self.slot.to_le_bytes());
        buf[284..288].copy_from_slice(&(self.phase as i32).to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < 16 {
            return Err(SnapshotError::Truncated {
                expected: RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let size = read_u64(&bytes[0..8]);
        let magic = read_u64(&bytes[8..16]);
        if magic != STATE_MAGIC {
            return Err(SnapshotError::BadMagic(magic));
        }
        if size != RECORD_SIZE as u64 {
            return Err(SnapshotError::UnknownSize(size));
        }
        if bytes.len() != RECORD_SIZE {
            return Err(SnapshotError::Truncated {
                expected: RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        let phase_code = read_i32(&bytes[284..288]);
        let phase = Phase::from_code(phase_code).ok_or(SnapshotError::UnknownPhase(phase_code))?;
        Ok(Self {
            pid: read_u64(&bytes[16..24]) as u32,
            phase,
            file: get_name(&bytes[24..152]),
            host: get_name(&bytes[152..280]),
            slot: read_i32(&bytes[280..284]),
        })
    }
}

fn put_name(field: &mut [u8], value: &str) {
    // Keep room for the NUL; cut on a char boundary.
    let mut end = value.len().min(field.len() - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&value.as_bytes()[..end]);
}

fn get_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

fn read_i32(bytes: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    i32::from_le_bytes(raw)
}

/// Path of the state file for `pid`.
pub fn state_file_path(state_dir: &Path, pid: u32) -> PathBuf {
    state_dir.join(format!("{STATE_PREFIX}{pid}"))
}

/// Read and decode one state file.
pub fn read_snapshot(path: &Path) -> io::Result<Result<PhaseSnapshot, SnapshotError>> {
    let bytes = fs::read(path)?;
    Ok(PhaseSnapshot::decode(&bytes))
}

/// Owns this process's two snapshots and its state file.
///
/// Write failures are logged and otherwise ignored; monitoring never
/// affects the build.
#[derive(Debug)]
pub struct StatePublisher {
    path: Option<PathBuf>,
    local: PhaseSnapshot,
    remote: PhaseSnapshot,
    current: StateTarget,
}

impl StatePublisher {
    /// Publisher writing under `state_dir` for the current process.
    pub fn new(state_dir: &Path) -> Self {
        Self::for_pid(state_dir, std::process::id())
    }

    pub fn for_pid(state_dir: &Path, pid: u32) -> Self {
        Self {
            path: Some(state_file_path(state_dir, pid)),
            local: PhaseSnapshot::new(pid),
            remote: PhaseSnapshot::new(pid),
            current: StateTarget::Local,
        }
    }

    /// Publisher that keeps snapshots in memory only.
    pub fn disabled() -> Self {
        let pid = std::process::id();
        Self {
            path: None,
            local: PhaseSnapshot::new(pid),
            remote: PhaseSnapshot::new(pid),
            current: StateTarget::Local,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn select(&mut self, target: StateTarget) -> &mut PhaseSnapshot {
        if target != StateTarget::Unknown {
            self.current = target;
        }
        match self.current {
            StateTarget::Remote => &mut self.remote,
            _ => &mut self.local,
        }
    }

    /// Current snapshot for `target`.
    pub fn snapshot(&self, target: StateTarget) -> &PhaseSnapshot {
        let target = if target == StateTarget::Unknown {
            self.current
        } else {
            target
        };
        match target {
            StateTarget::Remote => &self.remote,
            _ => &self.local,
        }
    }

    /// Record a phase transition and rewrite the state file.
    pub fn publish(
        &mut self,
        phase: Phase,
        source_file: Option<&str>,
        host: Option<&str>,
        target: StateTarget,
    ) {
        let snapshot = self.select(target);
        snapshot.phase = phase;
        if let Some(file) = source_file {
            snapshot.file = filename::basename(file).to_string();
        }
        if let Some(host) = host {
            snapshot.host = host.to_string();
        }
        let record = snapshot.encode();
        trace!(
            phase = phase.name(),
            file = %snapshot.file,
            host = %snapshot.host,
            "note state"
        );
        self.write(&record);
    }

    /// Record the slot taken for `target`.
    pub fn note_slot(&mut self, slot: u32, target: StateTarget) {
        self.select(target).slot = i32::try_from(slot).unwrap_or(i32::MAX);
    }

    fn write(&self, record: &[u8]) {
        let Some(path) = &self.path else {
            return;
        };
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(path, record));
        match result {
            Ok(()) => cleanup::register(path.clone()),
            Err(e) => warn!("failed to write state file {}: {}", path.display(), e),
        }
    }

    /// Delete the state file. Idempotent.
    pub fn remove(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        match fs::remove_file(path) {
            Ok(()) => trace!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove state file {}: {}", path.display(), e),
        }
        cleanup::unregister(path);
    }
}

impl Drop for StatePublisher {
    fn drop(&mut self) {
        self.remove();
    }
}
