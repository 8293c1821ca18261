//! Error taxonomy for extraction runs.
//!
//! Driver and tap operations return `anyhow::Result`; failures that callers
//! need to classify are raised as a [`SyncError`] and can be recovered with
//! `err.downcast_ref::<SyncError>()`.

use std::time::Duration;
use thiserror::Error;

/// Classified extraction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Missing or invalid settings. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// External process or service could not be reached or failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed tap output line or catalog shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tap installation failed. Cached per tap until the next readiness check.
    #[error("error installing tap [{tap}]: {message}")]
    Install { tap: String, message: String },

    /// A bounded external operation ran past its deadline.
    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The tap is still being installed (or its last install failed).
    #[error("tap [{tap}] is not ready{}", .cause.as_ref().map(|c| format!(": {}", c)).unwrap_or_default())]
    TapNotReady { tap: String, cause: Option<String> },
}

impl SyncError {
    /// Whether the orchestration layer may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::Timeout { .. } | SyncError::TapNotReady { .. }
        )
    }

    /// Timeouts are handled like unreachable collaborators.
    pub fn is_connection_class(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Timeout { .. })
    }
}

/// Classifies an `anyhow::Error`, if it carries a [`SyncError`] anywhere in its chain.
pub fn classify(err: &anyhow::Error) -> Option<&SyncError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
}
