//! # Error Types
//!
//! Structured error handling for the batching engine using thiserror,
//! plus the `DownReason` values that travel on the reply protocol when a
//! batch or dispatcher goes away.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a waiter was told its batch will never complete.
///
/// `Normal` is the end-of-stream sentinel, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownReason {
    /// Orderly completion of a streaming exchange.
    Normal,
    /// The dispatcher is gone or was never there.
    Noproc,
    /// The user compute function returned an error.
    Error(String),
    /// The user compute function panicked.
    Panic(String),
}

impl std::fmt::Display for DownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownReason::Normal => write!(f, "normal"),
            DownReason::Noproc => write!(f, "noproc"),
            DownReason::Error(msg) => write!(f, "error: {msg}"),
            DownReason::Panic(msg) => write!(f, "panic: {msg}"),
        }
    }
}

/// Errors surfaced by the batching engine.
#[derive(Error, Debug)]
pub enum BatchlineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("No dispatcher named '{name}' is running")]
    DispatcherNotFound { name: String },

    #[error("Batch failed: {reason}")]
    BatchFailed { reason: DownReason },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BatchlineError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a dispatcher-not-found error
    pub fn dispatcher_not_found(name: impl Into<String>) -> Self {
        Self::DispatcherNotFound { name: name.into() }
    }

    /// Create a batch-failed error from a down reason
    pub fn batch_failed(reason: DownReason) -> Self {
        Self::BatchFailed { reason }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the underlying cause is an absent dispatcher, the one
    /// failure cluster dispatch is allowed to retry.
    pub fn is_noproc(&self) -> bool {
        matches!(
            self,
            BatchlineError::DispatcherNotFound { .. }
                | BatchlineError::BatchFailed {
                    reason: DownReason::Noproc
                }
        )
    }
}

impl From<serde_json::Error> for BatchlineError {
    fn from(err: serde_json::Error) -> Self {
        BatchlineError::validation(format!("JSON error: {err}"))
    }
}

/// Result type alias for batching operations
pub type Result<T> = std::result::Result<T, BatchlineError>;
