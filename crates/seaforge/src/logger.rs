//! Per-call log filtering.
//!
//! Every [`crate::compile`] call owns a [`Logger`] carrying the verbosity from
//! its options. Events that pass the filter are forwarded to `tracing`, so the
//! embedding application decides where they end up.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Verbosity of a compile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Progress messages and warnings.
    Debug,
    /// Warnings only.
    #[default]
    Warn,
    /// Nothing at all, including the host fallback warning.
    Silent,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Warn => "warn",
            LogLevel::Silent => "silent",
        })
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "silent" | "off" => Ok(LogLevel::Silent),
            other => Err(Error::InputValidation(format!(
                "unknown log level '{other}' (expected debug, warn, or silent)"
            ))),
        }
    }
}

/// Filters events by [`LogLevel`] before handing them to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn debug_enabled(&self) -> bool {
        self.level == LogLevel::Debug
    }

    pub fn warn_enabled(&self) -> bool {
        self.level != LogLevel::Silent
    }

    pub fn debug(&self, message: impl fmt::Display) {
        if self.debug_enabled() {
            tracing::debug!("{message}");
        }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        if self.warn_enabled() {
            tracing::warn!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("silent".parse::<LogLevel>().unwrap(), LogLevel::Silent);
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(Error::InputValidation(_))
        ));
    }

    #[test]
    fn test_default_is_warn() {
        assert_eq!(LogLevel::default(), LogLevel::Warn);
        assert_eq!(Logger::default().level(), LogLevel::Warn);
    }

    #[test]
    fn test_filtering() {
        let silent = Logger::new(LogLevel::Silent);
        assert!(!silent.warn_enabled());
        assert!(!silent.debug_enabled());

        let warn = Logger::new(LogLevel::Warn);
        assert!(warn.warn_enabled());
        assert!(!warn.debug_enabled());

        let debug = Logger::new(LogLevel::Debug);
        assert!(debug.warn_enabled());
        assert!(debug.debug_enabled());
    }
}
