//! Logging Infrastructure
//!
//! Fiber-aware logging on top of `tracing`.
//!
//! # Overview
//!
//! Logging from inside an effect goes through [`Effect::log`](crate::Effect::log)
//! and [`Effect::log_at`](crate::Effect::log_at). The minimum level and the set
//! of annotations are ordinary fiber refs
//! ([`current_log_level`](crate::fiber_ref::current_log_level),
//! [`current_log_annotations`](crate::fiber_ref::current_log_annotations)), so
//! they follow the fiber tree: a child inherits its parent's annotations at fork
//! and annotations added by a child are merged back at join.
//!
//! Every event carries the emitting fiber's id as a structured field.
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, LogLevel};
//!
//! let program = Effect::log("request started")
//!     .zip_right(Effect::log_at(LogLevel::Debug, "cache miss"));
//! let annotated = Effect::annotate_logs("request_id", "req-42", program);
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::fiber::FiberId;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" | "5" => Some(LogLevel::Trace),
            "DEBUG" | "4" => Some(LogLevel::Debug),
            "INFO" | "3" => Some(LogLevel::Info),
            "WARN" | "WARNING" | "2" => Some(LogLevel::Warn),
            "ERROR" | "ERR" | "1" => Some(LogLevel::Error),
            "OFF" | "NONE" | "0" => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Whether a message at `self` passes a `minimum` level filter.
    pub fn enabled(self, minimum: LogLevel) -> bool {
        self != LogLevel::Off && minimum != LogLevel::Off && self >= minimum
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render annotations in a stable order.
fn render_annotations(annotations: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = annotations.iter().collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Emit a fiber log event through `tracing`.
pub(crate) fn emit(
    level: LogLevel,
    fiber: FiberId,
    annotations: &HashMap<String, String>,
    message: &str,
) {
    let annotations = render_annotations(annotations);
    match level {
        LogLevel::Trace => tracing::trace!(fiber = %fiber, annotations = %annotations, "{}", message),
        LogLevel::Debug => tracing::debug!(fiber = %fiber, annotations = %annotations, "{}", message),
        LogLevel::Info => tracing::info!(fiber = %fiber, annotations = %annotations, "{}", message),
        LogLevel::Warn => tracing::warn!(fiber = %fiber, annotations = %annotations, "{}", message),
        LogLevel::Error => tracing::error!(fiber = %fiber, annotations = %annotations, "{}", message),
        LogLevel::Off => {}
    }
}
