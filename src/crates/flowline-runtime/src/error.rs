//! Error types for the runtime primitives
//!
//! Every fallible runtime operation returns [`RuntimeError`]. Per-item
//! failures inside a batch are *not* surfaced through this type; they are
//! converted to `None` at the position of the failed item and only counted.

use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors produced by the runtime primitives
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The circuit breaker rejected the call without invoking it
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// A task exceeded its deadline
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// A unit of work failed
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Config file could not be parsed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An off-loaded blocking task panicked or was cancelled
    #[error("Blocking task failed to join: {0}")]
    Join(String),
}

impl RuntimeError {
    /// Build a [`RuntimeError::TaskFailed`] from anything printable
    pub fn task_failed(error: impl std::fmt::Display) -> Self {
        RuntimeError::TaskFailed(error.to_string())
    }

    /// Whether the error is a fast-fail rejection rather than a real failure
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RuntimeError::CircuitOpen)
    }

    /// Whether the error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout(_))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RuntimeError {
    fn from(err: serde_yaml::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RuntimeError {
    fn from(err: toml::de::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RuntimeError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            RuntimeError::Join("task panicked".to_string())
        } else {
            RuntimeError::Join("task was cancelled".to_string())
        }
    }
}

/// Format an error and its `source()` chain on one line
///
/// Used when a failure is logged and then replaced by a fallback value, so the
/// log line still carries the root cause.
///
/// ```rust
/// use flowline_runtime::error::{format_error_chain, RuntimeError};
///
/// let err = RuntimeError::TaskFailed("boom".to_string());
/// assert_eq!(format_error_chain(&err), "Task failed: boom");
/// ```
pub fn format_error_chain(error: &dyn StdError) -> String {
    let mut result = error.to_string();
    let mut current = error.source();

    while let Some(source) = current {
        result.push_str(": ");
        result.push_str(&source.to_string());
        current = source.source();
    }

    result
}
