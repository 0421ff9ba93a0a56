//! Replay-safe logging for workflow code.
//!
//! Workflow functions must not write to the host logger directly: a replayed
//! pass would emit every message again. Messages are buffered on the context
//! and flushed by the runtime only for passes that made progress.

use std::fmt;

/// Severity of a buffered workflow log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Forward a buffered workflow message to the host `tracing` subscriber.
pub(crate) fn emit(instance: &str, turn_index: u64, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(instance, turn_index, "{message}"),
        LogLevel::Info => tracing::info!(instance, turn_index, "{message}"),
        LogLevel::Warn => tracing::warn!(instance, turn_index, "{message}"),
        LogLevel::Error => tracing::error!(instance, turn_index, "{message}"),
    }
}
