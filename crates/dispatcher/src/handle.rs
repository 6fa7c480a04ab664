//! SinkHandle - manages a sink with isolated queue and worker task

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use contracts::{MergedBatch, RecordSink};

use crate::metrics::{MetricsSnapshot, SinkMetrics};

/// How batches reach the sink queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Wait for queue space (artifact files must contain every record)
    Lossless,
    /// Drop the batch when the queue is full
    BestEffort,
}

/// Handle to a running sink worker
pub struct SinkHandle {
    /// Sink name
    name: String,
    /// Channel to send batches to worker
    tx: mpsc::Sender<MergedBatch>,
    /// Delivery mode
    delivery: Delivery,
    /// Shared metrics
    metrics: Arc<SinkMetrics>,
    /// Worker task handle
    worker_handle: JoinHandle<()>,
}

impl SinkHandle {
    /// Create a new SinkHandle and spawn the worker task
    pub fn spawn<S: RecordSink + Send + 'static>(
        sink: S,
        queue_capacity: usize,
        delivery: Delivery,
    ) -> Self {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(SinkMetrics::new());

        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();

        let worker_handle = tokio::spawn(async move {
            sink_worker(sink, rx, worker_metrics, worker_name).await;
        });

        Self {
            name,
            tx,
            delivery,
            metrics,
            worker_handle,
        }
    }

    /// Get sink name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery mode
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Get current metrics
    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Deliver a batch according to the handle's delivery mode
    pub async fn dispatch(&self, batch: MergedBatch) -> bool {
        match self.delivery {
            Delivery::Lossless => self.send(batch).await,
            Delivery::BestEffort => self.try_send(batch),
        }
    }

    /// Send a batch, waiting for queue space
    pub async fn send(&self, batch: MergedBatch) -> bool {
        match self.tx.send(batch).await {
            Ok(()) => {
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                true
            }
            Err(_) => {
                error!(sink = %self.name, "Sink worker closed unexpectedly");
                self.metrics.inc_dropped_count();
                false
            }
        }
    }

    /// Send a batch to the sink (non-blocking)
    ///
    /// Returns true if sent, false if queue full (batch dropped)
    pub fn try_send(&self, batch: MergedBatch) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                true
            }
            Err(mpsc::error::TrySendError::Full(b)) => {
                self.metrics.inc_dropped_count();
                warn!(
                    sink = %self.name,
                    window = b.window_index,
                    "Queue full, batch dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(sink = %self.name, "Sink worker closed unexpectedly");
                false
            }
        }
    }

    /// Shutdown the sink worker gracefully
    ///
    /// Returns the final metrics once the sink is flushed and closed.
    #[instrument(name = "sink_handle_shutdown", skip(self), fields(sink = %self.name))]
    pub async fn shutdown(self) -> MetricsSnapshot {
        // Drop sender to signal worker to stop
        drop(self.tx);
        // Wait for worker to finish
        if let Err(e) = self.worker_handle.await {
            error!(sink = %self.name, error = ?e, "Worker task panicked");
            self.metrics.inc_failure_count();
        }
        debug!(sink = %self.name, "SinkHandle shutdown complete");
        self.metrics.snapshot()
    }
}

/// Worker task that consumes batches and writes to sink
#[instrument(
    name = "sink_worker_loop",
    skip(sink, rx, metrics),
    fields(sink = %name)
)]
async fn sink_worker<S: RecordSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<MergedBatch>,
    metrics: Arc<SinkMetrics>,
    name: String,
) {
    debug!(sink = %name, "Sink worker started");

    while let Some(batch) = rx.recv().await {
        // Update queue length
        metrics.set_queue_len(rx.len());

        match sink.write(&batch).await {
            Ok(()) => {
                metrics.record_write(batch.len());
                observability::record_batch_dispatched(&name, true);
            }
            Err(e) => {
                metrics.inc_failure_count();
                observability::record_batch_dispatched(&name, false);
                error!(
                    sink = %name,
                    window = batch.window_index,
                    error = %e,
                    "Write failed"
                );
                // Continue processing - don't crash on single failure
            }
        }
    }

    // Cleanup
    if let Err(e) = sink.flush().await {
        metrics.inc_failure_count();
        error!(sink = %name, error = %e, "Flush failed on shutdown");
    }
    if let Err(e) = sink.close().await {
        metrics.inc_failure_count();
        error!(sink = %name, error = %e, "Close failed on shutdown");
    }

    debug!(sink = %name, "Sink worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{MergedRecord, SyncError};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::{sleep, Duration};

    /// Mock sink for testing
    struct MockSink {
        name: String,
        write_count: Arc<AtomicU64>,
        should_fail: bool,
        delay_ms: u64,
    }

    impl RecordSink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&mut self, _batch: &MergedBatch) -> Result<(), SyncError> {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.should_fail {
                return Err(SyncError::sink_write(&self.name, "mock failure"));
            }
            self.write_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn batch(window_index: u64) -> MergedBatch {
        MergedBatch {
            window_index,
            records: vec![MergedRecord {
                global_index: window_index,
                timestamp: window_index * 10,
                channel: 1,
            }],
            missing_channels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_sink_handle_basic() {
        let write_count = Arc::new(AtomicU64::new(0));
        let sink = MockSink {
            name: "test".to_string(),
            write_count: Arc::clone(&write_count),
            should_fail: false,
            delay_ms: 0,
        };

        let handle = SinkHandle::spawn(sink, 10, Delivery::BestEffort);

        for i in 0..5 {
            assert!(handle.try_send(batch(i)));
        }

        let snapshot = handle.shutdown().await;
        assert_eq!(write_count.load(Ordering::Relaxed), 5);
        assert_eq!(snapshot.record_count, 5);
    }

    #[tokio::test]
    async fn test_sink_handle_queue_full() {
        let write_count = Arc::new(AtomicU64::new(0));
        let sink = MockSink {
            name: "slow".to_string(),
            write_count: Arc::clone(&write_count),
            should_fail: false,
            delay_ms: 100, // Slow sink
        };

        // Small queue capacity
        let handle = SinkHandle::spawn(sink, 2, Delivery::BestEffort);

        // Send more than queue can hold
        for i in 0..10 {
            handle.dispatch(batch(i)).await;
        }

        // Some should have been dropped
        assert!(handle.metrics().dropped_count() > 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_lossless_waits_for_slow_sink() {
        let write_count = Arc::new(AtomicU64::new(0));
        let sink = MockSink {
            name: "slow_file".to_string(),
            write_count: Arc::clone(&write_count),
            should_fail: false,
            delay_ms: 5,
        };

        let handle = SinkHandle::spawn(sink, 1, Delivery::Lossless);
        for i in 0..6 {
            assert!(handle.dispatch(batch(i)).await);
        }

        let snapshot = handle.shutdown().await;
        assert_eq!(write_count.load(Ordering::Relaxed), 6);
        assert!(snapshot.is_complete());
    }

    #[tokio::test]
    async fn test_sink_handle_failure_isolation() {
        let sink = MockSink {
            name: "failing".to_string(),
            write_count: Arc::new(AtomicU64::new(0)),
            should_fail: true,
            delay_ms: 0,
        };

        let handle = SinkHandle::spawn(sink, 10, Delivery::BestEffort);

        for i in 0..3 {
            handle.try_send(batch(i));
        }

        // Give worker time to process
        sleep(Duration::from_millis(50)).await;

        // Should have recorded failures
        assert!(handle.metrics().failure_count() > 0);

        let snapshot = handle.shutdown().await;
        assert_eq!(snapshot.failure_count, 3);
    }
}
