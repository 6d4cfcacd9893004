//! Recursion guard.
//!
//! In masquerade mode a misconfigured PATH can make the client find itself
//! instead of the real compiler. Every child process inherits
//! `_DISTCC_SAFEGUARD` set one higher than our own level, so a nested client
//! sees a non-zero level and refuses to distribute again.

use std::env;
use tracing::trace;

/// Environment variable carrying the recursion level.
pub const SAFEGUARD_VAR: &str = "_DISTCC_SAFEGUARD";

/// Recursion level of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecursionGuard {
    level: u32,
}

impl RecursionGuard {
    /// Read the level from the environment.
    pub fn from_env() -> Self {
        Self::from_value(env::var(SAFEGUARD_VAR).ok().as_deref())
    }

    /// Level for a given variable value: absent is 0; present but zero or
    /// unparsable is 1.
    pub fn from_value(value: Option<&str>) -> Self {
        let level = match value {
            None => 0,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(0) | Err(_) => 1,
                Ok(n) => n,
            },
        };
        trace!("safeguard level={level}");
        Self { level }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// True when we are already running underneath another client.
    pub fn is_nested(&self) -> bool {
        self.level > 0
    }

    /// Variable to set on every child process.
    pub fn child_env(&self) -> (&'static str, String) {
        (SAFEGUARD_VAR, (self.level + 1).to_string())
    }
}
