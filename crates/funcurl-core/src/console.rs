//! Guest console output.
//!
//! Script `console` calls reach [`emit`] through a sync op as they happen
//! and are re-emitted as `tracing` events tagged `guest_log = true`. Each
//! module gets a console naming it; templates and the global `console`
//! name the running program.

use tracing::{debug, error, info, warn};

/// Log level of a guest console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// `console.debug`.
    Debug,
    /// `console.log` and `console.info`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error`.
    Error,
}

impl LogLevel {
    /// Map a console method name onto a level. Unknown methods log at info.
    pub fn from_method(method: &str) -> Self {
        match method {
            "debug" | "trace" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Emit one guest line as a tracing event attributed to `script`.
pub fn emit(script: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(script, guest_log = true, "{}", message),
        LogLevel::Info => info!(script, guest_log = true, "{}", message),
        LogLevel::Warn => warn!(script, guest_log = true, "{}", message),
        LogLevel::Error => error!(script, guest_log = true, "{}", message),
    }
}
