//! ChannelBlock - Ingestion output
//!
//! One sub-acquisition window of raw timestamps for one channel.

use serde::{Deserialize, Serialize};

/// Instrument channel number (small positive integer, >= 1)
pub type ChannelId = u8;

/// Raw timestamp block for one channel and one window
///
/// Owned by the listener until it is handed to the merger, which consumes it exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBlock {
    /// Source channel
    pub channel: ChannelId,

    /// Receipt order within the channel (window-aligned)
    pub sequence_index: u64,

    /// Timestamps in instrument units (picoseconds for the reference protocol)
    pub timestamps: Vec<u64>,
}

impl ChannelBlock {
    pub fn new(channel: ChannelId, sequence_index: u64, timestamps: Vec<u64>) -> Self {
        Self {
            channel,
            sequence_index,
            timestamps,
        }
    }

    /// Whether the window carried no events
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Last (largest) timestamp of the block
    pub fn last_timestamp(&self) -> Option<u64> {
        self.timestamps.iter().copied().max()
    }
}

/// Event emitted by a channel listener towards the merge worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Next block for the channel
    Block(ChannelBlock),

    /// Producer closed the stream (explicit end-of-stream)
    Closed { channel: ChannelId, blocks: u64 },

    /// Listener failed; other channels continue
    Failed { channel: ChannelId, message: String },
}

impl ChannelEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Block(block) => block.channel,
            ChannelEvent::Closed { channel, .. } | ChannelEvent::Failed { channel, .. } => *channel,
        }
    }
}
