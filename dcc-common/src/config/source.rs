//! Where configuration values come from.
//!
//! Every value resolved by [`EnvParser`](super::EnvParser) remembers its
//! origin, so the debug log can say which variable or file put it in effect.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Origin of a configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Named environment variable.
    Environment(String),
    /// File under the state directory, e.g. `hosts`.
    StateFile(PathBuf),
}

impl ConfigSource {
    pub fn is_default(&self) -> bool {
        matches!(self, ConfigSource::Default)
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, ConfigSource::Environment(_))
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("default"),
            ConfigSource::Environment(var) => write!(f, "${var}"),
            ConfigSource::StateFile(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A value and its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    pub fn from_env(value: T, var_name: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment(var_name.into()),
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigSource::StateFile(path.into()),
        }
    }

    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    /// Environment variable that supplied the value, if any.
    pub fn env_var(&self) -> Option<&str> {
        match &self.source {
            ConfigSource::Environment(var) => Some(var),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
        }
    }
}

impl<T: Default> Default for Sourced<T> {
    fn default() -> Self {
        Self::default_value(T::default())
    }
}
