//! Wire protocol - Control, notification and file-transfer messages
//!
//! All messages are externally tagged enums / structs so the variant itself
//! is the message kind on the wire.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ChannelId, StatusReport};

/// Largest control or file frame on a stream channel
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Frame bytes reserved for the `FileFrame::Chunk` envelope (tag, index, length)
pub const CHUNK_FRAME_OVERHEAD: usize = 64;

/// Largest `transfer.chunk_size` whose chunk frame still fits in `MAX_FRAME_BYTES`
pub const MAX_CHUNK_BYTES: usize = MAX_FRAME_BYTES - CHUNK_FRAME_OVERHEAD;

/// Wall-clock time in nanoseconds since UNIX epoch
///
/// Returns 0 only if the system clock is set before 1970.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Master → slave command (command channel, request/response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Query slave status
    Status,

    /// Ask the slave to prepare for a trigger
    RequestReady { sequence_id: u64 },

    /// Stop the active acquisition
    Stop,

    /// Cancel and return to idle
    Reset,

    /// Push the leading fraction of the merged sequence
    RequestPartialData { sequence_id: u64, fraction: f64 },

    /// Push the whole merged sequence
    RequestFullData { sequence_id: u64 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::RequestReady { .. } => "request_ready",
            Command::Stop => "stop",
            Command::Reset => "reset",
            Command::RequestPartialData { .. } => "request_partial_data",
            Command::RequestFullData { .. } => "request_full_data",
        }
    }
}

/// Slave → master response to a `Command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Command accepted
    Ack,

    /// Status snapshot
    Status(StatusReport),

    /// Try again later (acquisition running / data not ready)
    Busy { message: String },

    /// Command refused
    Rejected { reason: String },

    /// File push started on the data channel
    TransferStarted { filename: String, size: u64 },
}

/// Trigger broadcast (master → slave, datagram)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    /// Master trigger timestamp (ns since UNIX epoch)
    pub trigger_timestamp_ns: u64,

    /// Requested acquisition time
    pub duration_seconds: f64,

    /// Active channels
    pub channels: Vec<ChannelId>,

    /// Session sequence id
    pub sequence_id: u64,
}

/// Slave → master notification (notification channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    /// Slave finished preparing and waits for the trigger
    ReadyForTrigger { sequence_id: u64 },

    /// Slave received the trigger
    TriggerReceived {
        sequence_id: u64,
        received_at_ns: u64,
    },
}

impl Notification {
    pub fn sequence_id(&self) -> u64 {
        match self {
            Notification::ReadyForTrigger { sequence_id }
            | Notification::TriggerReceived { sequence_id, .. } => *sequence_id,
        }
    }
}

/// Heartbeat datagram (slave → master)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Sender wall clock (ns)
    pub sent_at_ns: u64,

    /// Status snapshot
    pub report: StatusReport,
}

/// File transfer frame (data channel)
///
/// `Header` once, then `chunk_count` `Chunk`s in index order, then `Footer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileFrame {
    Header {
        filename: String,
        size: u64,
        chunk_count: u64,
    },
    Chunk {
        index: u64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Footer {
        filename: String,
        chunks_sent: u64,
    },
}

impl FileFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            FileFrame::Header { .. } => "header",
            FileFrame::Chunk { .. } => "chunk",
            FileFrame::Footer { .. } => "footer",
        }
    }
}
