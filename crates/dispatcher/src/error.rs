//! Dispatcher error types

use std::path::Path;

use contracts::SyncError;
use thiserror::Error;

/// Dispatcher-specific errors
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Sink creation error
    #[error("failed to create sink '{name}': {message}")]
    SinkCreation { name: String, message: String },

    /// Sink reported write failures during the session
    #[error("sink '{name}' failed {failures} write(s)")]
    SinkFailed { name: String, failures: u64 },

    /// Malformed artifact file
    #[error("invalid file '{path}': {message}")]
    Format { path: String, message: String },

    /// Report serialization error
    #[error("report serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sink write error (from contract)
    #[error("sink error: {0}")]
    Contract(#[from] SyncError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatcherError {
    /// Create a sink creation error
    pub fn sink_creation(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkCreation {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a format error
    pub fn format(path: &Path, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

impl From<DispatcherError> for SyncError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::Contract(inner) => inner,
            DispatcherError::Io(inner) => SyncError::Io(inner),
            DispatcherError::SinkCreation { name, message } => SyncError::sink_write(name, message),
            DispatcherError::SinkFailed { name, failures } => {
                SyncError::sink_write(name, format!("{failures} write(s) failed"))
            }
            other => SyncError::Other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatcherError>;
