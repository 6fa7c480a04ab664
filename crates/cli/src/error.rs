//! Error types for CLI operations.

use contracts::{NodeRole, SyncError};
use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration is for the other role
    #[error("Configuration {path} is for a {found} node, expected {expected}")]
    RoleMismatch {
        path: String,
        found: NodeRole,
        expected: NodeRole,
    },

    /// Invalid command-line argument
    #[error("Invalid argument --{name}: {message}")]
    InvalidArgument { name: String, message: String },

    /// Sessions that did not complete
    #[error("{failed} of {total} session(s) failed")]
    SessionsFailed { failed: u32, total: u32 },

    /// Session / configuration error
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn invalid_argument(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
