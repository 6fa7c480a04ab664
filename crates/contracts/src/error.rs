//! Layered error definitions
//!
//! Session taxonomy: handshake / instrument / merge / estimation / transfer,
//! plus configuration and general errors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ChannelId;

/// Session phase an error belongs to (used in user-visible messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Config,
    Handshake,
    Acquisition,
    Merge,
    Estimation,
    Transfer,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Handshake => "handshake",
            Phase::Acquisition => "acquisition",
            Phase::Merge => "merge",
            Phase::Estimation => "estimation",
            Phase::Transfer => "transfer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type
#[derive(Debug, Error)]
pub enum SyncError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Handshake Errors =====
    /// Peer did not answer / signal readiness within the retry bound
    #[error("handshake timeout after {attempts} attempt(s) ({waited_ms}ms): {message}")]
    HandshakeTimeout {
        attempts: u32,
        waited_ms: u64,
        message: String,
    },

    /// Another session is already running on this coordinator
    #[error("session busy: acquisition {active_sequence_id} is still active")]
    SessionBusy { active_sequence_id: u64 },

    /// Malformed or unexpected message on a control channel
    #[error("protocol error on {channel_kind} channel: {message}")]
    Protocol {
        channel_kind: String,
        message: String,
    },

    // ===== Instrument Errors =====
    /// Hardware command rejected or instrument unreachable
    #[error("instrument command '{command}' failed: {message}")]
    InstrumentCommandFailure { command: String, message: String },

    // ===== Merge Errors =====
    /// A channel failed to deliver an expected window
    #[error("merge stall on channel {channel}: {message}")]
    MergeStall { channel: ChannelId, message: String },

    // ===== Estimation Errors =====
    /// Empty or all-outlier sample set
    #[error("insufficient data for offset estimation: {message}")]
    EstimationInsufficientData { message: String },

    // ===== Transfer Errors =====
    /// File could not be opened / sent / received
    #[error("transfer of '{filename}' failed: {message}")]
    TransferFailure { filename: String, message: String },

    // ===== Sink Errors =====
    /// Sink write error
    #[error("sink '{sink_name}' write error: {message}")]
    SinkWrite { sink_name: String, message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol(channel_kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            channel_kind: channel_kind.into(),
            message: message.into(),
        }
    }

    /// Create instrument command failure
    pub fn instrument(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InstrumentCommandFailure {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create merge stall error
    pub fn merge_stall(channel: ChannelId, message: impl Into<String>) -> Self {
        Self::MergeStall {
            channel,
            message: message.into(),
        }
    }

    /// Create insufficient-data error
    pub fn insufficient_data(message: impl Into<String>) -> Self {
        Self::EstimationInsufficientData {
            message: message.into(),
        }
    }

    /// Create transfer failure
    pub fn transfer(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransferFailure {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create sink write error
    pub fn sink_write(sink_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SinkWrite {
            sink_name: sink_name.into(),
            message: message.into(),
        }
    }

    /// Phase this error aborts (or degrades)
    pub fn phase(&self) -> Phase {
        match self {
            Self::ConfigParse { .. } | Self::ConfigValidation { .. } => Phase::Config,
            Self::HandshakeTimeout { .. } | Self::SessionBusy { .. } | Self::Protocol { .. } => {
                Phase::Handshake
            }
            Self::InstrumentCommandFailure { .. } | Self::Other(_) => Phase::Acquisition,
            Self::MergeStall { .. } | Self::SinkWrite { .. } | Self::Io(_) => Phase::Merge,
            Self::EstimationInsufficientData { .. } => Phase::Estimation,
            Self::TransferFailure { .. } => Phase::Transfer,
        }
    }

    /// Channel the error is attributed to, if any
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::MergeStall { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Human-readable message naming the failed phase (and channel)
    pub fn session_message(&self) -> String {
        match self.channel() {
            Some(channel) => format!("{} failed (channel {}): {}", self.phase(), channel, self),
            None => format!("{} failed: {}", self.phase(), self),
        }
    }

    /// Whether the session can still complete with this error recorded
    pub fn is_degraded_only(&self) -> bool {
        matches!(
            self,
            Self::MergeStall { .. } | Self::EstimationInsufficientData { .. }
        )
    }
}
