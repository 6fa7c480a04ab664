//! Stream merger implementation.
//!
//! Windows are merged in cursor order. Window `c` is released when every active
//! channel has delivered block `c`, or when the wait bound expires (stall flush).
//! Channels missing `stall_windows` consecutive windows are closed so one silent
//! channel cannot hold back the others.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use contracts::{ChannelBlock, ChannelEvent, ChannelId, MergeSummary, MergedBatch, MergedRecord};
use tracing::{debug, info, instrument, trace, warn};

use crate::buffer::{BlockBuffer, PushOutcome};
use crate::window::WindowTiming;

/// Channel state inside the merger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    /// Expected to deliver every window
    Active,
    /// Closed after too many consecutive missing windows; reactivated by a new block
    Stalled,
    /// Producer sent end-of-stream
    Closed,
    /// Listener failed
    Failed,
}

#[derive(Debug)]
struct ChannelState {
    buffer: BlockBuffer,
    status: ChannelStatus,
    consecutive_stalls: u32,
}

impl ChannelState {
    /// Whether window `index` still waits for this channel
    fn is_pending(&self, index: u64) -> bool {
        self.status == ChannelStatus::Active && self.buffer.next_index() <= index
    }
}

/// Multi-channel timestamp merger
#[derive(Debug)]
pub struct StreamMerger {
    timing: WindowTiming,
    channels: BTreeMap<ChannelId, ChannelState>,
    /// Next window to release
    cursor: u64,
    next_global_index: u64,
    last_emitted: Option<u64>,
    /// Records above the watermark, released with a later window
    held: Vec<(u64, ChannelId)>,
    /// Arrival time of the first block of each pending window
    first_seen: BTreeMap<u64, Instant>,
    summary: MergeSummary,
}

impl StreamMerger {
    /// Create a merger for the given channel set
    pub fn new<I>(channels: I, timing: WindowTiming, buffer_capacity: usize) -> Self
    where
        I: IntoIterator<Item = ChannelId>,
    {
        let channels = channels
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    ChannelState {
                        buffer: BlockBuffer::new(buffer_capacity),
                        status: ChannelStatus::Active,
                        consecutive_stalls: 0,
                    },
                )
            })
            .collect();

        Self {
            timing,
            channels,
            cursor: 0,
            next_global_index: 0,
            last_emitted: None,
            held: Vec::new(),
            first_seen: BTreeMap::new(),
            summary: MergeSummary::default(),
        }
    }

    /// Handle one listener event
    pub fn handle_event(&mut self, event: ChannelEvent, now: Instant) -> Vec<MergedBatch> {
        match event {
            ChannelEvent::Block(block) => self.push(block, now),
            ChannelEvent::Closed { channel, blocks } => self.close_channel(channel, blocks, now),
            ChannelEvent::Failed { channel, message } => self.fail_channel(channel, message, now),
        }
    }

    /// Push a block into the merger
    ///
    /// Returns the batches that became releasable.
    #[instrument(
        level = "trace",
        name = "stream_merger_push",
        skip(self, block, now),
        fields(channel = block.channel, sequence_index = block.sequence_index)
    )]
    pub fn push(&mut self, block: ChannelBlock, now: Instant) -> Vec<MergedBatch> {
        let cursor = self.cursor;
        let Some(state) = self.channels.get_mut(&block.channel) else {
            warn!(channel = block.channel, "block for unknown channel ignored");
            return Vec::new();
        };
        state.consecutive_stalls = 0;

        if block.sequence_index < cursor {
            self.summary.late_blocks_dropped += 1;
            metrics::counter!("tagsync_late_blocks_total", "channel" => block.channel.to_string())
                .increment(1);
            debug!(
                channel = block.channel,
                sequence_index = block.sequence_index,
                cursor,
                "late block dropped"
            );
            return self.poll(now);
        }

        if state.status == ChannelStatus::Stalled {
            info!(channel = block.channel, "stalled channel resumed");
            state.status = ChannelStatus::Active;
        }

        match state.buffer.push(block.sequence_index, block.timestamps) {
            PushOutcome::Stored => {}
            PushOutcome::Evicted(index) => {
                self.summary.overflow_blocks_dropped += 1;
                metrics::counter!(
                    "tagsync_overflow_blocks_total",
                    "channel" => block.channel.to_string()
                )
                .increment(1);
                warn!(channel = block.channel, evicted = index, "channel buffer overflow");
            }
            PushOutcome::Duplicate => {
                warn!(
                    channel = block.channel,
                    sequence_index = block.sequence_index,
                    "duplicate block ignored"
                );
                return self.poll(now);
            }
        }
        observability::record_buffer_depth(block.channel, state.buffer.len());
        self.first_seen.entry(block.sequence_index).or_insert(now);

        self.poll(now)
    }

    /// Producer end-of-stream for a channel
    pub fn close_channel(&mut self, channel: ChannelId, blocks: u64, now: Instant) -> Vec<MergedBatch> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if state.status != ChannelStatus::Failed {
                state.status = ChannelStatus::Closed;
            }
            if !self.summary.closed_channels.contains(&channel) {
                self.summary.closed_channels.push(channel);
            }
            info!(channel, blocks, "channel closed");
        }
        self.poll(now)
    }

    /// Listener failure for a channel; the others continue
    pub fn fail_channel(
        &mut self,
        channel: ChannelId,
        message: impl Into<String>,
        now: Instant,
    ) -> Vec<MergedBatch> {
        let message = message.into();
        if let Some(state) = self.channels.get_mut(&channel) {
            state.status = ChannelStatus::Failed;
            warn!(channel, error = %message, "channel failed, merging without it");
            self.summary.channel_failures.insert(channel, message);
        }
        self.poll(now)
    }

    /// Release every ready window and flush the current one if its wait expired
    pub fn poll(&mut self, now: Instant) -> Vec<MergedBatch> {
        let mut batches = Vec::new();
        loop {
            if self.is_ready(self.cursor) {
                if !self.has_data(self.cursor) {
                    break;
                }
                batches.push(self.merge_window(Vec::new()));
                continue;
            }
            if self.stall_due(now) {
                let batch = self.flush_stalled();
                batches.push(batch);
                continue;
            }
            break;
        }
        batches
    }

    /// Stop merging: release complete windows, drop partial trailing windows and
    /// flush held records
    #[instrument(name = "stream_merger_finish", skip(self))]
    pub fn finish(mut self) -> (Vec<MergedBatch>, MergeSummary) {
        let mut batches = Vec::new();
        while self.is_ready(self.cursor) && self.has_data(self.cursor) {
            batches.push(self.merge_window(Vec::new()));
        }

        let cursor = self.cursor;
        let trailing: BTreeSet<u64> = self
            .channels
            .values()
            .flat_map(|state| state.buffer.indices())
            .filter(|index| *index >= cursor)
            .collect();
        if !trailing.is_empty() {
            warn!(
                count = trailing.len(),
                first = trailing.first().copied(),
                "partial trailing windows dropped"
            );
        }
        self.summary.trailing_windows_dropped += trailing.len() as u64;
        for state in self.channels.values_mut() {
            state.buffer.clear();
        }

        if !self.held.is_empty() {
            let mut held = std::mem::take(&mut self.held);
            held.sort_unstable();
            let records = self.emit(held);
            batches.push(MergedBatch {
                window_index: self.cursor,
                records,
                missing_channels: Vec::new(),
            });
        }

        info!(
            windows_merged = self.summary.windows_merged,
            windows_stalled = self.summary.windows_stalled,
            records = self.summary.records_emitted,
            "merge finished"
        );
        (batches, self.summary)
    }

    /// Current diagnostics
    pub fn summary(&self) -> &MergeSummary {
        &self.summary
    }

    /// Next window to release
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// No channel is expected to deliver any more blocks
    pub fn all_channels_done(&self) -> bool {
        self.channels
            .values()
            .all(|state| matches!(state.status, ChannelStatus::Closed | ChannelStatus::Failed))
    }

    fn is_ready(&self, index: u64) -> bool {
        !self.channels.values().any(|state| state.is_pending(index))
    }

    /// Some channel buffered (or skipped past) window `index`
    fn has_data(&self, index: u64) -> bool {
        self.channels
            .values()
            .any(|state| state.buffer.contains(index) || state.buffer.next_index() > index)
    }

    fn stall_due(&self, now: Instant) -> bool {
        match self.first_seen.get(&self.cursor) {
            Some(first) => now.saturating_duration_since(*first) >= self.timing.max_wait(),
            None => false,
        }
    }

    /// Release the cursor window without the channels that are still pending
    fn flush_stalled(&mut self) -> MergedBatch {
        let index = self.cursor;
        let stall_windows = self.timing.stall_windows;
        let mut pending = Vec::new();

        for (channel, state) in self.channels.iter_mut() {
            if !state.is_pending(index) {
                continue;
            }
            pending.push(*channel);
            state.consecutive_stalls += 1;
            *self.summary.channel_stalls.entry(*channel).or_insert(0) += 1;
            metrics::counter!("tagsync_channel_stalls_total", "channel" => channel.to_string())
                .increment(1);

            if state.consecutive_stalls >= stall_windows {
                state.status = ChannelStatus::Stalled;
                if !self.summary.closed_channels.contains(channel) {
                    self.summary.closed_channels.push(*channel);
                }
                warn!(
                    channel = *channel,
                    windows = state.consecutive_stalls,
                    "channel silent for too many windows, closing"
                );
            }
        }

        debug!(window = index, missing = ?pending, "window wait expired");
        self.merge_window(pending)
    }

    /// Merge window `cursor` across channels and advance the cursor
    fn merge_window(&mut self, mut missing: Vec<ChannelId>) -> MergedBatch {
        let index = self.cursor;
        let mut merged = std::mem::take(&mut self.held);
        let mut watermark: Option<u64> = None;

        for (channel, state) in self.channels.iter_mut() {
            match state.buffer.take(index) {
                Some(timestamps) => {
                    if state.status == ChannelStatus::Active {
                        state.consecutive_stalls = 0;
                    }
                    if let Some(last) = timestamps.iter().copied().max() {
                        watermark = Some(watermark.map_or(last, |w| w.min(last)));
                    }
                    merged.extend(timestamps.into_iter().map(|ts| (ts, *channel)));
                }
                None => {
                    if state.status == ChannelStatus::Active && !missing.contains(channel) {
                        missing.push(*channel);
                    }
                }
            }
        }

        merged.sort_unstable();
        // Records above the lowest per-channel maximum may still be preceded by
        // the next window of a slower channel.
        let released = match watermark {
            Some(watermark) => {
                let split = merged.partition_point(|(ts, _)| *ts <= watermark);
                self.held = merged.split_off(split);
                merged
            }
            None => {
                self.held = merged;
                Vec::new()
            }
        };

        let records = self.emit(released);
        missing.sort_unstable();
        if missing.is_empty() {
            self.summary.windows_merged += 1;
        } else {
            self.summary.windows_stalled += 1;
        }

        self.first_seen = self.first_seen.split_off(&(index + 1));
        self.cursor = index + 1;
        trace!(window = index, records = records.len(), "window merged");

        MergedBatch {
            window_index: index,
            records,
            missing_channels: missing,
        }
    }

    fn emit(&mut self, sorted: Vec<(u64, ChannelId)>) -> Vec<MergedRecord> {
        let mut records = Vec::with_capacity(sorted.len());
        for (timestamp, channel) in sorted {
            if self.last_emitted.is_some_and(|last| timestamp < last) {
                self.summary.order_violations += 1;
                warn!(timestamp, channel, "record below emitted watermark dropped");
                continue;
            }
            self.last_emitted = Some(timestamp);
            records.push(MergedRecord {
                global_index: self.next_global_index,
                timestamp,
                channel,
            });
            self.next_global_index += 1;
        }
        self.summary.records_emitted += records.len() as u64;
        records
    }
}
