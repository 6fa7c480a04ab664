//! MergeWorker - runs the StreamMerger on its own task

use std::time::{Duration, Instant};

use async_channel::Receiver;
use contracts::{AcquisitionConfig, ChannelEvent, ChannelId, MergeConfig, MergeSummary, MergedBatch};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use observability::SessionMetricsAggregator;
use tracing::{debug, info, instrument, warn};

use crate::engine::StreamMerger;
use crate::window::WindowTiming;

/// Merge worker
///
/// Receives listener events, forwards released batches and returns the merge
/// summary once the listeners are done or the session is cancelled.
pub struct MergeWorker {
    merger: StreamMerger,
    poll_interval: Duration,
    metrics: SessionMetricsAggregator,
}

impl MergeWorker {
    pub fn new(channels: &[ChannelId], acquisition: &AcquisitionConfig, merge: &MergeConfig) -> Self {
        let timing = WindowTiming::from_config(acquisition, merge);
        debug!(
            channels = channels.len(),
            max_wait_ms = timing.max_wait().as_millis() as u64,
            "merge worker configured"
        );
        Self {
            merger: StreamMerger::new(channels.iter().copied(), timing, merge.buffer_capacity),
            poll_interval: merge.poll_interval(),
            metrics: SessionMetricsAggregator::new(),
        }
    }

    /// Run until every channel closed, the event queue closed or `cancel` fired
    ///
    /// Events already queued at cancellation are still merged.
    #[instrument(name = "merge_worker", skip_all)]
    pub async fn run(
        mut self,
        events: Receiver<ChannelEvent>,
        batches: mpsc::Sender<MergedBatch>,
        cancel: CancellationToken,
    ) -> MergeSummary {
        let mut sink_open = true;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("merge worker cancelled");
                    break;
                }
                received = timeout(self.poll_interval, events.recv()) => received,
            };

            let released = match received {
                Err(_) => self.merger.poll(Instant::now()),
                Ok(Ok(event)) => self.merger.handle_event(event, Instant::now()),
                Ok(Err(_)) => {
                    debug!("listener event queue closed");
                    break;
                }
            };
            sink_open = forward(&batches, released, sink_open, &mut self.metrics).await;

            if self.merger.all_channels_done() {
                debug!("all channels done");
                break;
            }
        }

        while let Ok(event) = events.try_recv() {
            let released = self.merger.handle_event(event, Instant::now());
            sink_open = forward(&batches, released, sink_open, &mut self.metrics).await;
        }

        let (released, summary) = self.merger.finish();
        forward(&batches, released, sink_open, &mut self.metrics).await;

        observability::record_merge_summary(&summary);
        info!(
            windows_merged = summary.windows_merged,
            windows_stalled = summary.windows_stalled,
            trailing_dropped = summary.trailing_windows_dropped,
            records = summary.records_emitted,
            degraded_rate = format!("{:.2}%", self.metrics.degraded_rate()),
            "merge worker finished"
        );
        debug!(
            records_per_window = self.metrics.window_records.mean(),
            channel_records = ?self.metrics.channel_records,
            missing_windows = ?self.metrics.missing_counts,
            "merge window statistics"
        );
        summary
    }
}

/// Forward batches downstream; returns false once the receiver is gone
async fn forward(
    batches: &mpsc::Sender<MergedBatch>,
    released: Vec<MergedBatch>,
    mut sink_open: bool,
    metrics: &mut SessionMetricsAggregator,
) -> bool {
    for batch in released {
        observability::record_batch_metrics(&batch);
        metrics.update(&batch);
        if !sink_open {
            continue;
        }
        if batches.send(batch).await.is_err() {
            warn!("batch receiver dropped, merged output discarded");
            sink_open = false;
        }
    }
    sink_open
}
