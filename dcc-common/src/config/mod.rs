//! Configuration for the client.
//!
//! All tunables are read from the environment exactly once, at startup,
//! into a [`ClientConfig`] that is then passed by reference to every
//! component. Nothing below this module reads `DISTCC_*` variables itself.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use crate::errors::DccError;
use serde::Serialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default backoff period after a host failure.
pub const DEFAULT_BACKOFF_PERIOD: Duration = Duration::from_secs(60);

/// Default pause between full unsuccessful slot scans.
pub const DEFAULT_PAUSE_TIME: Duration = Duration::from_millis(1000);

/// Default number of discrepancies tolerated before server-side
/// preprocessing is abandoned.
pub const DEFAULT_MAX_DISCREPANCY: u32 = 1;

/// Variables that change the compiler's include search path. Any of them
/// being set makes server-side preprocessing unsafe.
pub const INCLUDE_PATH_VARS: [&str; 3] = ["CPATH", "C_INCLUDE_PATH", "CPLUS_INCLUDE_PATH"];

/// Resolved client configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientConfig {
    /// State root (`DISTCC_DIR`, default `~/.distcc`).
    pub top_dir: PathBuf,
    /// `DISTCC_BACKOFF_PERIOD`; zero disables backoff.
    pub backoff_period: Duration,
    /// `DISTCC_MAX_DISCREPANCY`; always at least 1.
    pub max_discrepancy: u32,
    /// `DISTCC_PAUSE_TIME_MSEC`; zero means rescan immediately.
    pub pause_time: Duration,
    /// `DISTCC_SKIP_LOCAL_RETRY` is set.
    pub skip_local_retry: bool,
    /// `DISTCC_FALLBACK`, default true.
    pub fallback: bool,
    /// `DISTCC_EXCLUDE_FRESH_FILES` glob.
    pub exclude_fresh_files: Option<String>,
    /// `INCLUDE_SERVER_PORT`, the include server's socket path.
    pub include_server_port: Option<PathBuf>,
    /// Name of the first include-path variable found set, if any.
    pub include_path_override: Option<String>,
    /// `DISTCC_TESTING_INCLUDE_SERVER`: include server failures are fatal.
    pub testing_include_server: bool,
    /// `DISTCC_ENABLE_REMOTE_ASSEMBLE`: `.s`/`.S` count as sources.
    pub remote_assemble: bool,
    /// `DISTCC_HOSTS`, the raw host list.
    pub hosts: Option<String>,
}

impl ClientConfig {
    /// Defaults rooted at `top_dir`, ignoring the environment.
    pub fn with_top_dir(top_dir: impl Into<PathBuf>) -> Self {
        Self {
            top_dir: top_dir.into(),
            backoff_period: DEFAULT_BACKOFF_PERIOD,
            max_discrepancy: DEFAULT_MAX_DISCREPANCY,
            pause_time: DEFAULT_PAUSE_TIME,
            skip_local_retry: false,
            fallback: true,
            exclude_fresh_files: None,
            include_server_port: None,
            include_path_override: None,
            testing_include_server: false,
            remote_assemble: false,
            hosts: None,
        }
    }

    /// Resolve the configuration from the process environment.
    ///
    /// An invalid `DISTCC_MAX_DISCREPANCY` is fatal; other malformed
    /// values are reported as warnings and replaced by their defaults.
    pub fn from_env() -> Result<Self, DccError> {
        let mut parser = EnvParser::new();

        let top_dir = traced("top_dir", parser.get_path("DIR", "~/.distcc"));
        let backoff_secs = traced(
            "backoff_period",
            parser.get_number("BACKOFF_PERIOD", DEFAULT_BACKOFF_PERIOD.as_secs(), 0..=u64::MAX),
        );
        let pause_msec = traced(
            "pause_time",
            parser.get_number(
                "PAUSE_TIME_MSEC",
                DEFAULT_PAUSE_TIME.as_millis() as u64,
                0..=u64::MAX,
            ),
        );
        let max_discrepancy = traced(
            "max_discrepancy",
            parser.get_number(
                "MAX_DISCREPANCY",
                i64::from(DEFAULT_MAX_DISCREPANCY),
                i64::MIN..=i64::MAX,
            ),
        );
        let skip_local_retry = traced("skip_local_retry", parser.get_flag("SKIP_LOCAL_RETRY"));
        let fallback = traced("fallback", parser.get_bool("FALLBACK", true));
        let exclude_fresh_files = traced(
            "exclude_fresh_files",
            parser.get_optional_string("EXCLUDE_FRESH_FILES"),
        );
        let testing_include_server = traced(
            "testing_include_server",
            parser.get_bool("TESTING_INCLUDE_SERVER", false),
        );
        let remote_assemble = traced(
            "remote_assemble",
            parser.get_bool("ENABLE_REMOTE_ASSEMBLE", false),
        );
        let hosts = traced("hosts", parser.get_optional_string("HOSTS"));

        let mut plain = EnvParser::with_prefix("");
        let include_server_port = traced(
            "include_server_port",
            plain.get_optional_path("INCLUDE_SERVER_PORT"),
        );
        let include_path_override = traced(
            "include_path_override",
            plain.first_set(&INCLUDE_PATH_VARS),
        );

        let mut errors = parser.take_errors();
        errors.extend(plain.take_errors());

        let discrepancy_error = errors
            .iter()
            .position(|e| e.var() == "DISTCC_MAX_DISCREPANCY");
        if let Some(idx) = discrepancy_error {
            return Err(DccError::BadArguments(errors.swap_remove(idx).to_string()));
        }
        let max_discrepancy = u32::try_from(max_discrepancy)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                DccError::BadArguments(format!(
                    "bad value for DISTCC_MAX_DISCREPANCY: {max_discrepancy}"
                ))
            })?;

        for err in &errors {
            warn!("{err}; using default");
        }

        Ok(Self {
            top_dir,
            backoff_period: Duration::from_secs(backoff_secs),
            max_discrepancy,
            pause_time: Duration::from_millis(pause_msec),
            skip_local_retry,
            fallback,
            exclude_fresh_files,
            include_server_port,
            include_path_override,
            testing_include_server,
            remote_assemble,
            hosts,
        })
    }

    /// Directory holding slot locks and backoff markers.
    pub fn lock_dir(&self) -> PathBuf {
        self.top_dir.join("lock")
    }

    /// Directory holding per-process phase snapshots.
    pub fn state_dir(&self) -> PathBuf {
        self.top_dir.join("state")
    }

    /// Host list file consulted when `DISTCC_HOSTS` is unset.
    pub fn hosts_file(&self) -> PathBuf {
        self.top_dir.join("hosts")
    }

    pub fn top_dir(&self) -> &Path {
        &self.top_dir
    }
}

fn traced<T: Debug>(field: &str, value: Sourced<T>) -> T {
    if !value.source.is_default() {
        debug!(field, origin = %value.source, value = ?value.value, "config value");
    }
    value.value
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    const VARS: [&str; 8] = [
        "DISTCC_DIR",
        "DISTCC_BACKOFF_PERIOD",
        "DISTCC_MAX_DISCREPANCY",
        "DISTCC_PAUSE_TIME_MSEC",
        "DISTCC_SKIP_LOCAL_RETRY",
        "DISTCC_FALLBACK",
        "INCLUDE_SERVER_PORT",
        "CPLUS_INCLUDE_PATH",
    ];

    fn cleanup_env() {
        for var in VARS {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { std::env::set_var(key, value) };
    }

    #[test]
    fn test_defaults() {
        let _guard = env_test_lock();
        cleanup_env();
        set_env("DISTCC_DIR", "/tmp/dcc-defaults");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.top_dir, PathBuf::from("/tmp/dcc-defaults"));
        assert_eq!(config.backoff_period, Duration::from_secs(60));
        assert_eq!(config.pause_time, Duration::from_millis(1000));
        assert_eq!(config.max_discrepancy, 1);
        assert!(config.fallback);
        assert!(!config.skip_local_retry);
        assert_eq!(config.lock_dir(), PathBuf::from("/tmp/dcc-defaults/lock"));
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/dcc-defaults/state"));

        cleanup_env();
    }

    #[test]
    fn test_overrides() {
        let _guard = env_test_lock();
        cleanup_env();
        set_env("DISTCC_BACKOFF_PERIOD", "0");
        set_env("DISTCC_PAUSE_TIME_MSEC", "0");
        set_env("DISTCC_MAX_DISCREPANCY", "3");
        set_env("DISTCC_SKIP_LOCAL_RETRY", "");
        set_env("DISTCC_FALLBACK", "0");
        set_env("INCLUDE_SERVER_PORT", "/tmp/is/socket");
        set_env("CPLUS_INCLUDE_PATH", "/opt/include");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.backoff_period, Duration::ZERO);
        assert_eq!(config.pause_time, Duration::ZERO);
        assert_eq!(config.max_discrepancy, 3);
        assert!(config.skip_local_retry);
        assert!(!config.fallback);
        assert_eq!(
            config.include_server_port,
            Some(PathBuf::from("/tmp/is/socket"))
        );
        assert_eq!(
            config.include_path_override.as_deref(),
            Some("CPLUS_INCLUDE_PATH")
        );

        cleanup_env();
    }

    #[test]
    fn test_non_positive_max_discrepancy_is_fatal() {
        let _guard = env_test_lock();
        cleanup_env();

        for bad in ["0", "-2", "many"] {
            set_env("DISTCC_MAX_DISCREPANCY", bad);
            let err = ClientConfig::from_env().unwrap_err();
            assert!(
                matches!(err, DccError::BadArguments(_)),
                "expected BadArguments for {bad}, got {err:?}"
            );
            assert!(err.is_fatal());
        }

        cleanup_env();
    }

    #[test]
    fn test_malformed_backoff_falls_back_to_default() {
        let _guard = env_test_lock();
        cleanup_env();
        set_env("DISTCC_BACKOFF_PERIOD", "soon");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.backoff_period, DEFAULT_BACKOFF_PERIOD);

        cleanup_env();
    }
}
