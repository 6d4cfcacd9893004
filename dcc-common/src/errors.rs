//! Error taxonomy and process exit codes.
//!
//! Every failure the client can report maps onto a numeric exit code so that
//! build tools driving the client can tell a compiler failure (the compiler's
//! own status is passed through) from a client failure (100 and up).
//!
//! | Code | Name            | Handling                                  |
//! |------|-----------------|-------------------------------------------|
//! | 100  | DistccFailed    | recoverable, fall back to local           |
//! | 101  | BadArguments    | fatal                                     |
//! | 103  | ConnectFailed   | recoverable                               |
//! | 105  | OutOfMemory     | fatal                                     |
//! | 106  | BadHostSpec     | recoverable (no remote hosts)             |
//! | 107  | IoError         | recoverable                               |
//! | 110  | CompilerMissing | fatal                                     |
//! | 111  | Recursion       | fatal                                     |
//! | 114  | Busy            | recoverable, retry                        |
//! | 116  | NoHosts         | recoverable, fall back to local           |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Numeric exit codes reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ExitCode {
    DistccFailed = 100,
    BadArguments = 101,
    ConnectFailed = 103,
    OutOfMemory = 105,
    BadHostSpec = 106,
    IoError = 107,
    CompilerMissing = 110,
    Recursion = 111,
    Busy = 114,
    NoHosts = 116,
}

impl ExitCode {
    /// The process exit status for this code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Short lowercase name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            ExitCode::DistccFailed => "failed",
            ExitCode::BadArguments => "bad arguments",
            ExitCode::ConnectFailed => "connect failed",
            ExitCode::OutOfMemory => "out of memory",
            ExitCode::BadHostSpec => "bad host specification",
            ExitCode::IoError => "I/O error",
            ExitCode::CompilerMissing => "compiler missing",
            ExitCode::Recursion => "recursion",
            ExitCode::Busy => "busy",
            ExitCode::NoHosts => "no hosts",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Errors raised by the placement engine and its collaborators.
#[derive(Debug, Error)]
pub enum DccError {
    /// Malformed invocation or configuration value.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Generic distribution failure.
    #[error("{0}")]
    Failed(String),

    #[error("out of memory")]
    OutOfMemory,

    /// The host list could not be parsed.
    #[error("bad host specification: {0}")]
    BadHostSpec(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The client invoked itself through a masqueraded compiler name.
    #[error("recursion detected (safeguard level {level}); check that the real compiler is on PATH")]
    Recursion { level: u32 },

    /// Every slot on every candidate host is taken.
    #[error("all slots are busy")]
    Busy,

    #[error("no usable hosts")]
    NoHosts,

    #[error("could not find the real compiler: {0}")]
    CompilerMissing(String),

    /// Failure reported by an external collaborator with its own code.
    #[error("{message}")]
    Collaborator { code: ExitCode, message: String },
}

impl DccError {
    /// Wrap an I/O error with a description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        DccError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an I/O error on a path.
    pub fn io_path(action: &str, path: &Path, source: io::Error) -> Self {
        DccError::io(format!("failed to {action} {}", path.display()), source)
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            DccError::BadArguments(_) => ExitCode::BadArguments,
            DccError::Failed(_) => ExitCode::DistccFailed,
            DccError::OutOfMemory => ExitCode::OutOfMemory,
            DccError::BadHostSpec(_) => ExitCode::BadHostSpec,
            DccError::Io { .. } => ExitCode::IoError,
            DccError::Recursion { .. } => ExitCode::Recursion,
            DccError::Busy => ExitCode::Busy,
            DccError::NoHosts => ExitCode::NoHosts,
            DccError::CompilerMissing(_) => ExitCode::CompilerMissing,
            DccError::Collaborator { code, .. } => *code,
        }
    }

    /// Errors that terminate the process instead of falling back.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.exit_code(),
            ExitCode::BadArguments
                | ExitCode::OutOfMemory
                | ExitCode::Recursion
                | ExitCode::CompilerMissing
        )
    }

    /// Errors after which the build can still be completed locally.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = DccError> = std::result::Result<T, E>;
