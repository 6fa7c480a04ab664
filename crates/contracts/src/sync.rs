//! MergedBatch - Stream merger output
//!
//! Globally time-ordered records and merge diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ChannelId;

/// One record of the merged, time-ordered stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergedRecord {
    /// Position in the merged output (monotonically increasing)
    pub global_index: u64,

    /// Timestamp value in instrument units
    pub timestamp: u64,

    /// Source channel
    pub channel: ChannelId,
}

/// Records released by the merger for one window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedBatch {
    /// Window (cursor) index this batch was released for
    pub window_index: u64,

    /// Records in non-decreasing timestamp order
    pub records: Vec<MergedRecord>,

    /// Channels that did not deliver this window (stall)
    pub missing_channels: Vec<ChannelId>,
}

impl MergedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch was released with gaps
    pub fn is_degraded(&self) -> bool {
        !self.missing_channels.is_empty()
    }
}

/// Merge diagnostics for one acquisition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    /// Windows merged with every active channel present
    pub windows_merged: u64,

    /// Windows released after the wait bound with missing channels
    pub windows_stalled: u64,

    /// Trailing partial windows dropped at finish
    pub trailing_windows_dropped: u64,

    /// Blocks that arrived for an already released window
    pub late_blocks_dropped: u64,

    /// Blocks evicted because a channel buffer overflowed
    pub overflow_blocks_dropped: u64,

    /// Records that regressed below the emitted watermark
    pub order_violations: u64,

    /// Records written to the merged output
    pub records_emitted: u64,

    /// Stalled windows per channel
    pub channel_stalls: BTreeMap<ChannelId, u64>,

    /// Channels closed (end-of-stream or too many consecutive stalls)
    pub closed_channels: Vec<ChannelId>,

    /// Listener failures per channel
    pub channel_failures: BTreeMap<ChannelId, String>,
}

impl MergeSummary {
    /// Whether the merged output is complete (no stalls, drops or failures)
    pub fn is_clean(&self) -> bool {
        self.windows_stalled == 0
            && self.trailing_windows_dropped == 0
            && self.late_blocks_dropped == 0
            && self.overflow_blocks_dropped == 0
            && self.order_violations == 0
            && self.channel_failures.is_empty()
    }
}
