//! Instrument error types

use contracts::{ChannelId, SyncError};
use thiserror::Error;

/// Instrument specific error
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// Driver not connected
    #[error("instrument not connected")]
    NotConnected,

    /// Command rejected by the instrument
    #[error("instrument command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Producer could not reach a channel listener
    #[error("channel {channel} stream to {addr} failed: {message}")]
    StreamFailed {
        channel: ChannelId,
        addr: String,
        message: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstrumentError {
    /// Create command failure
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create stream failure
    pub fn stream(channel: ChannelId, addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StreamFailed {
            channel,
            addr: addr.into(),
            message: message.into(),
        }
    }
}

impl From<InstrumentError> for SyncError {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::NotConnected => SyncError::instrument("connect", "not connected"),
            InstrumentError::CommandFailed { command, message } => {
                SyncError::instrument(command, message)
            }
            other @ InstrumentError::StreamFailed { .. } => {
                SyncError::instrument("stream", other.to_string())
            }
            InstrumentError::Io(e) => SyncError::instrument("io", e.to_string()),
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, InstrumentError>;
