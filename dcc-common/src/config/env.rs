//! Reading `DISTCC_*` variables.
//!
//! Malformed values are collected rather than returned so that
//! [`ClientConfig`](super::ClientConfig) can decide which ones are fatal and
//! warn about the rest.

use super::source::Sourced;
use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// A variable that was set but could not be used.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("bad value for {var}: expected {expected}, got {value:?}")]
    Malformed {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var}={value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("{var} starts with ~ but there is no home directory")]
    NoHomeDir { var: String },
}

impl EnvError {
    pub fn var(&self) -> &str {
        match self {
            EnvError::Malformed { var, .. }
            | EnvError::OutOfRange { var, .. }
            | EnvError::NoHomeDir { var } => var,
        }
    }
}

/// Reads variables under one prefix, remembering where each value came from.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Parser for `DISTCC_*`.
    pub fn new() -> Self {
        Self::with_prefix("DISTCC_")
    }

    /// Parser for another prefix; `""` reads `INCLUDE_SERVER_PORT`, `CPATH`
    /// and friends.
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and its value, if set. Non-UTF-8 values are
    /// converted lossily.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var = format!("{}{name}", self.prefix);
        let value = env::var_os(&var).map(|v| v.to_string_lossy().into_owned());
        (var, value)
    }

    /// Set at all, even to the empty string.
    pub fn get_flag(&mut self, name: &str) -> Sourced<bool> {
        match self.lookup(name) {
            (var, Some(_)) => Sourced::from_env(true, var),
            (_, None) => Sourced::default_value(false),
        }
    }

    /// `1`/`0`, also `yes`/`no`, `true`/`false`, `on`/`off`. Unset or empty
    /// keeps `default`.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let value = match raw.trim().to_ascii_lowercase().as_str() {
            "" => return Sourced::default_value(default),
            "1" | "yes" | "true" | "on" => true,
            "0" | "no" | "false" | "off" => false,
            _ => {
                self.errors.push(EnvError::Malformed {
                    var,
                    expected: "0 or 1",
                    value: raw,
                });
                return Sourced::default_value(default);
            }
        };
        Sourced::from_env(value, var)
    }

    /// A number within `range`. Anything else is recorded and replaced by
    /// `default`.
    pub fn get_number<T>(&mut self, name: &str, default: T, range: RangeInclusive<T>) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display,
    {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let Ok(value) = raw.trim().parse::<T>() else {
            self.errors.push(EnvError::Malformed {
                var,
                expected: "a number",
                value: raw,
            });
            return Sourced::default_value(default);
        };
        if !range.contains(&value) {
            self.errors.push(EnvError::OutOfRange {
                var,
                value: value.to_string(),
                min: range.start().to_string(),
                max: range.end().to_string(),
            });
            return Sourced::default_value(default);
        }
        Sourced::from_env(value, var)
    }

    /// A directory, with a leading `~/` expanded. Unset or empty uses
    /// `default`, which is expanded the same way.
    pub fn get_path(&mut self, name: &str, default: &str) -> Sourced<PathBuf> {
        let (var, raw) = self.lookup(name);
        let (text, from_env) = match raw {
            Some(v) if !v.is_empty() => (v, true),
            _ => (default.to_string(), false),
        };

        let path = match text.strip_prefix("~/") {
            None => PathBuf::from(&text),
            Some(rest) => match dirs::home_dir() {
                Some(home) => home.join(rest),
                None => {
                    self.errors.push(EnvError::NoHomeDir { var: var.clone() });
                    env::temp_dir().join(rest)
                }
            },
        };

        if from_env {
            Sourced::from_env(path, var)
        } else {
            Sourced::default_value(path)
        }
    }

    /// `None` when unset; set but empty also counts as `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (var, Some(v)) => Sourced::from_env(Some(v).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        self.get_optional_string(name).map(|v| v.map(PathBuf::from))
    }

    /// Name of the first of `names` that is set to something non-empty.
    pub fn first_set(&mut self, names: &[&str]) -> Sourced<Option<String>> {
        names
            .iter()
            .find_map(|name| match self.lookup(name) {
                (var, Some(v)) if !v.is_empty() => Some(var),
                _ => None,
            })
            .map_or_else(
                || Sourced::default_value(None),
                |var| Sourced::from_env(Some(var.clone()), var),
            )
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
