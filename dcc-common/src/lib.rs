//! dcc - Common Library
//!
//! Job placement and compile classification for the dcc distributed compile
//! client: command-line scanning, host model and locking, backoff, state
//! snapshots and configuration.

// Use deny instead of forbid to allow specific overrides for env var manipulation
// in tests (env::set_var/remove_var are unsafe in Rust 2024)
#![deny(unsafe_code)]

pub mod args;
pub mod backoff;
pub mod cleanup;
pub mod config;
pub mod discrepancy;
pub mod dotd;
pub mod errors;
pub mod filename;
pub mod hostlist;
pub mod hosts;
pub mod lock;
pub mod logging;
pub mod safeguard;
pub mod selector;
pub mod state;

pub use args::{Classification, CompileRequest, DotdInfo, scan_args};
pub use backoff::ReputationTracker;
pub use config::{ClientConfig, ConfigSource, EnvError, EnvParser, Sourced};
pub use discrepancy::DiscrepancyCounter;
pub use errors::{DccError, ExitCode, Result};
pub use filename::SuffixRules;
pub use hostlist::{EnvHostListProvider, HostListProvider, parse_host_list};
pub use hosts::{
    Compression, CppWhere, HostDefinition, HostMode, HostRegistry, ProtocolVersion,
};
pub use lock::{FileLockProvider, LockError, LockKind, LockProvider, SlotLock};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use safeguard::RecursionGuard;
pub use selector::{HostSelector, candidate_hosts};
pub use state::{Phase, PhaseSnapshot, StatePublisher, StateTarget};
