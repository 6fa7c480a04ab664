//! Per-channel ingestion metrics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use contracts::ChannelId;

/// Counters for one channel listener
#[derive(Debug, Default)]
pub struct ChannelCounters {
    /// Blocks received
    pub blocks_received: AtomicU64,

    /// Timestamps received
    pub timestamps_received: AtomicU64,

    /// Malformed / undecodable frames
    pub frame_errors: AtomicU64,
}

impl ChannelCounters {
    /// Record block received
    pub fn record_block(&self, timestamps: usize) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.timestamps_received
            .fetch_add(timestamps as u64, Ordering::Relaxed);
    }

    /// Record frame error
    pub fn record_frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            timestamps_received: self.timestamps_received.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
        }
    }
}

/// Ingestion metrics
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    channels: BTreeMap<ChannelId, ChannelCounters>,

    /// Current event queue length
    pub queue_len: AtomicUsize,
}

impl IngestionMetrics {
    /// Create metrics for a channel set
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|ch| (ch, ChannelCounters::default()))
                .collect(),
            queue_len: AtomicUsize::new(0),
        }
    }

    /// Counters for one channel
    pub fn channel(&self, channel: ChannelId) -> Option<&ChannelCounters> {
        self.channels.get(&channel)
    }

    /// Update queue length
    pub fn update_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    /// Get snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels: self
                .channels
                .iter()
                .map(|(ch, counters)| (*ch, counters.snapshot()))
                .collect(),
            queue_len: self.queue_len.load(Ordering::Relaxed),
        }
    }
}

/// Channel counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub blocks_received: u64,
    pub timestamps_received: u64,
    pub frame_errors: u64,
}

/// Metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Per channel counters
    pub channels: BTreeMap<ChannelId, ChannelSnapshot>,

    /// Current queue length
    pub queue_len: usize,
}

impl MetricsSnapshot {
    /// Total blocks over all channels
    pub fn total_blocks(&self) -> u64 {
        self.channels.values().map(|c| c.blocks_received).sum()
    }

    /// Total timestamps over all channels
    pub fn total_timestamps(&self) -> u64 {
        self.channels.values().map(|c| c.timestamps_received).sum()
    }
}
