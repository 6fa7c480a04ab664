//! LogSink - logs batch summary via tracing

use contracts::{MergedBatch, RecordSink, SyncError};
use tracing::{debug, info, instrument, warn};

/// Sink that logs batch summaries for debugging
pub struct LogSink {
    name: String,
    batches: u64,
    records: u64,
}

impl LogSink {
    /// Create a new LogSink with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: 0,
            records: 0,
        }
    }

    fn log_batch_summary(&self, batch: &MergedBatch) {
        let first = batch.records.first().map(|r| r.timestamp);
        let last = batch.records.last().map(|r| r.timestamp);

        if batch.is_degraded() {
            warn!(
                sink = %self.name,
                window = batch.window_index,
                records = batch.len(),
                missing = ?batch.missing_channels,
                "MergedBatch released with missing channels"
            );
        } else {
            debug!(
                sink = %self.name,
                window = batch.window_index,
                records = batch.len(),
                first,
                last,
                "MergedBatch received"
            );
        }
    }
}

impl RecordSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        level = "trace",
        name = "log_sink_write",
        skip(self, batch),
        fields(sink = %self.name, window = batch.window_index)
    )]
    async fn write(&mut self, batch: &MergedBatch) -> Result<(), SyncError> {
        self.batches += 1;
        self.records += batch.len() as u64;
        self.log_batch_summary(batch);
        Ok(())
    }

    #[instrument(name = "log_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), SyncError> {
        // Nothing to flush for log sink
        Ok(())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), SyncError> {
        info!(
            sink = %self.name,
            batches = self.batches,
            records = self.records,
            "LogSink closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_write() {
        let mut sink = LogSink::new("test_log");
        let batch = MergedBatch {
            window_index: 1,
            records: Vec::new(),
            missing_channels: vec![2],
        };

        let result = sink.write(&batch).await;
        assert!(result.is_ok());
        assert_eq!(sink.batches, 1);
    }

    #[tokio::test]
    async fn test_log_sink_name() {
        let sink = LogSink::new("my_logger");
        assert_eq!(sink.name(), "my_logger");
    }
}
