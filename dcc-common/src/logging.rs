//! Logging initialization for the client.
//!
//! The client runs inside other people's builds, so by default it only
//! prints warnings and errors to stderr. `DISTCC_LOG` sends everything from
//! info up to a file instead; `DISTCC_VERBOSE` lowers the level to debug.

use crate::config::EnvParser;
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, fmt::writer::BoxMakeWriter, util::SubscriberInitExt};

/// Logging output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human-readable records.
    Compact,
    /// JSON records for machine parsing.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Configuration for logging initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error, off).
    pub level: String,
    pub format: LogFormat,
    /// Log file; stderr when unset.
    pub file_path: Option<PathBuf>,
    /// Include file and line number in records.
    pub with_file_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            file_path: None,
            with_file_line: false,
        }
    }
}

impl LogConfig {
    /// Build a logging configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - DISTCC_LOG (path of a log file; raises the level to info)
    /// - DISTCC_VERBOSE (debug level)
    /// - DISTCC_LOG_FORMAT (compact|json)
    pub fn from_env() -> Self {
        let mut parser = EnvParser::new();
        let file_path = parser.get_optional_path("LOG").value;
        let verbose = parser.get_bool("VERBOSE", false).value;
        let format = parser
            .get_optional_string("LOG_FORMAT")
            .value
            .and_then(|f| LogFormat::parse(&f))
            .unwrap_or(LogFormat::Compact);

        let level = if verbose {
            "debug"
        } else if file_path.is_some() {
            "info"
        } else {
            "warn"
        };

        Self {
            level: level.to_string(),
            format,
            file_path,
            with_file_line: verbose,
        }
    }

    /// Override the base log level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Build the effective EnvFilter, honoring RUST_LOG if set.
    pub fn env_filter(&self) -> EnvFilter {
        if std::env::var_os("RUST_LOG").is_some()
            && let Ok(filter) = EnvFilter::try_from_default_env()
        {
            return filter;
        }
        EnvFilter::new(&self.level)
    }
}

fn build_writer(config: &LogConfig) -> Result<(BoxMakeWriter, bool)> {
    let Some(path) = config.file_path.as_ref() else {
        return Ok((BoxMakeWriter::new(std::io::stderr), true));
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("dcc.log"));
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy().into_owned())
        .build(dir)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok((BoxMakeWriter::new(appender), false))
}

/// Initialize tracing-based logging for the current process.
///
/// A second call in the same process is a no-op.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter();
    let (writer, ansi) = build_writer(config)?;

    match config.format {
        LogFormat::Compact => {
            let subscriber = fmt::Subscriber::builder()
                .with_writer(writer)
                .with_target(false)
                .with_file(config.with_file_line)
                .with_line_number(config.with_file_line)
                .with_env_filter(filter)
                .with_ansi(ansi)
                .compact()
                .finish();
            finish_subscriber(subscriber)
        }
        LogFormat::Json => {
            let subscriber = fmt::Subscriber::builder()
                .with_writer(writer)
                .with_file(config.with_file_line)
                .with_line_number(config.with_file_line)
                .with_env_filter(filter)
                .with_ansi(false)
                .json()
                .finish();
            finish_subscriber(subscriber)
        }
    }
}

fn finish_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = subscriber.try_init() {
        if err.to_string().contains("already") {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}
