//! Coordinator error types

use contracts::SyncError;
use dispatcher::DispatcherError;
use instrument::InstrumentError;
use ingestion::IngestionError;
use thiserror::Error;

use crate::wire::ChannelKind;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Session-level error
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Frame could not be encoded or decoded
    #[error("{channel} frame codec error: {message}")]
    Codec {
        channel: ChannelKind,
        message: String,
    },

    /// Peer closed the connection before answering
    #[error("{channel} channel closed by peer")]
    Closed { channel: ChannelKind },

    /// No answer within the deadline
    #[error("{channel} channel timed out after {waited_ms}ms")]
    Timeout { channel: ChannelKind, waited_ms: u64 },

    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    pub fn codec(channel: ChannelKind, message: impl Into<String>) -> Self {
        Self::Codec {
            channel,
            message: message.into(),
        }
    }

    pub fn timeout(channel: ChannelKind, waited: std::time::Duration) -> Self {
        Self::Timeout {
            channel,
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Control channel the error happened on
    pub fn channel(&self) -> Option<ChannelKind> {
        match self {
            Self::Codec { channel, .. } | Self::Closed { channel } | Self::Timeout { channel, .. } => {
                Some(*channel)
            }
            _ => None,
        }
    }
}

impl From<CoordinatorError> for SyncError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Sync(inner) => inner,
            CoordinatorError::Instrument(inner) => inner.into(),
            CoordinatorError::Ingestion(inner) => inner.into(),
            CoordinatorError::Dispatcher(inner) => inner.into(),
            CoordinatorError::Io(inner) => SyncError::Io(inner),
            other => {
                let kind = other.channel().map_or("coordinator", |c| c.as_str());
                SyncError::protocol(kind, other.to_string())
            }
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, CoordinatorError>;
