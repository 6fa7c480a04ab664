//! Dispatcher - main loop for fan-out to sinks

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use contracts::{MergedBatch, OutputConfig, RecordLayout};

use crate::error::DispatcherError;
use crate::handle::{Delivery, SinkHandle};
use crate::metrics::MetricsSnapshot;
use crate::report::ArtifactNames;
use crate::sinks::{BinaryFileSink, LogSink, TextFileSink};

/// Sink kind and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkType {
    /// tracing summary per batch
    Log,
    /// Binary artifact
    Binary { path: PathBuf, layout: RecordLayout },
    /// Text artifact with header comment lines
    Text { path: PathBuf, header: Vec<String> },
}

impl SinkType {
    /// File sinks never drop batches
    pub fn delivery(&self) -> Delivery {
        match self {
            SinkType::Log => Delivery::BestEffort,
            SinkType::Binary { .. } | SinkType::Text { .. } => Delivery::Lossless,
        }
    }
}

/// Configuration of one sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub name: String,
    pub sink_type: SinkType,
    pub queue_capacity: usize,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Sink configurations
    pub sinks: Vec<SinkConfig>,
}

impl DispatcherConfig {
    /// Sinks for the merged output of one session
    ///
    /// Always the binary artifact; the text artifact and log sink when enabled.
    pub fn for_session(output: &OutputConfig, names: &ArtifactNames, header: Vec<String>) -> Self {
        let mut sinks = vec![SinkConfig {
            name: "merged_binary".to_string(),
            sink_type: SinkType::Binary {
                path: output.dir.join(names.merged_binary()),
                layout: output.layout,
            },
            queue_capacity: output.queue_capacity,
        }];
        if output.write_text {
            sinks.push(SinkConfig {
                name: "merged_text".to_string(),
                sink_type: SinkType::Text {
                    path: output.dir.join(names.merged_text()),
                    header,
                },
                queue_capacity: output.queue_capacity,
            });
        }
        if output.log_sink {
            sinks.push(SinkConfig {
                name: "log".to_string(),
                sink_type: SinkType::Log,
                queue_capacity: output.queue_capacity,
            });
        }
        Self { sinks }
    }
}

/// Builder for creating a Dispatcher
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    input_rx: mpsc::Receiver<MergedBatch>,
}

impl DispatcherBuilder {
    /// Create a new DispatcherBuilder
    pub fn new(config: DispatcherConfig, input_rx: mpsc::Receiver<MergedBatch>) -> Self {
        Self { config, input_rx }
    }

    /// Build and start the dispatcher
    #[instrument(name = "dispatcher_builder_build", skip(self))]
    pub fn build(self) -> Result<Dispatcher, DispatcherError> {
        let handles = Self::initialize_handles(&self.config)?;

        Ok(Dispatcher {
            handles,
            input_rx: self.input_rx,
        })
    }

    #[instrument(
        name = "dispatcher_initialize_handles",
        skip(config),
        fields(sink_count = config.sinks.len())
    )]
    fn initialize_handles(config: &DispatcherConfig) -> Result<Vec<SinkHandle>, DispatcherError> {
        let mut handles = Vec::with_capacity(config.sinks.len());
        for sink_config in &config.sinks {
            handles.push(create_sink_handle(sink_config)?);
        }
        Ok(handles)
    }
}

/// Create a SinkHandle from configuration
#[instrument(
    name = "dispatcher_create_sink_handle",
    skip(config),
    fields(sink = %config.name)
)]
fn create_sink_handle(config: &SinkConfig) -> Result<SinkHandle, DispatcherError> {
    let delivery = config.sink_type.delivery();
    match &config.sink_type {
        SinkType::Log => {
            let sink = LogSink::new(&config.name);
            Ok(SinkHandle::spawn(sink, config.queue_capacity, delivery))
        }
        SinkType::Binary { path, layout } => {
            let sink = BinaryFileSink::new(&config.name, path, *layout)
                .map_err(|e| DispatcherError::sink_creation(&config.name, e.to_string()))?;
            Ok(SinkHandle::spawn(sink, config.queue_capacity, delivery))
        }
        SinkType::Text { path, header } => {
            let sink = TextFileSink::new(&config.name, path, header)
                .map_err(|e| DispatcherError::sink_creation(&config.name, e.to_string()))?;
            Ok(SinkHandle::spawn(sink, config.queue_capacity, delivery))
        }
    }
}

/// Final state of one sink
#[derive(Debug, Clone)]
pub struct SinkOutcome {
    pub name: String,
    pub delivery: Delivery,
    pub metrics: MetricsSnapshot,
}

/// Result of a dispatcher run
#[derive(Debug, Clone, Default)]
pub struct DispatchSummary {
    /// Batches received from the merger
    pub batches: u64,
    pub sinks: Vec<SinkOutcome>,
}

impl DispatchSummary {
    /// Fail if a lossless sink missed any batch
    pub fn ensure_complete(&self) -> Result<(), DispatcherError> {
        for sink in &self.sinks {
            if sink.delivery == Delivery::Lossless && !sink.metrics.is_complete() {
                return Err(DispatcherError::SinkFailed {
                    name: sink.name.clone(),
                    failures: sink.metrics.failure_count + sink.metrics.dropped_count,
                });
            }
        }
        Ok(())
    }
}

/// The main Dispatcher that fans out batches to sinks
pub struct Dispatcher {
    handles: Vec<SinkHandle>,
    input_rx: mpsc::Receiver<MergedBatch>,
}

impl Dispatcher {
    /// Create a dispatcher with custom sink handles (for testing)
    pub fn with_handles(handles: Vec<SinkHandle>, input_rx: mpsc::Receiver<MergedBatch>) -> Self {
        Self { handles, input_rx }
    }

    /// Get metrics for all sinks
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.handles
            .iter()
            .map(|h| (h.name().to_string(), h.metrics().snapshot()))
            .collect()
    }

    /// Run the dispatcher main loop
    ///
    /// Consumes batches from input and fans out to all sinks.
    /// Returns when input channel is closed and every sink is closed.
    #[instrument(name = "dispatcher_run", skip(self))]
    pub async fn run(mut self) -> DispatchSummary {
        info!(sinks = self.handles.len(), "Dispatcher started");

        let mut batch_count: u64 = 0;

        while let Some(batch) = self.input_rx.recv().await {
            batch_count += 1;
            self.dispatch_batch(batch).await;

            if batch_count.is_multiple_of(100) {
                debug!(batches = batch_count, "Dispatcher progress");
            }
        }

        info!(
            batches = batch_count,
            "Dispatcher input closed, shutting down"
        );

        let sinks = Self::shutdown_handles(self.handles).await;

        info!("Dispatcher shutdown complete");
        DispatchSummary {
            batches: batch_count,
            sinks,
        }
    }

    /// Spawn the dispatcher as a background task
    pub fn spawn(self) -> JoinHandle<DispatchSummary> {
        tokio::spawn(self.run())
    }

    async fn dispatch_batch(&self, batch: MergedBatch) {
        for handle in &self.handles {
            handle.dispatch(batch.clone()).await;
        }
    }

    async fn shutdown_handles(handles: Vec<SinkHandle>) -> Vec<SinkOutcome> {
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let name = handle.name().to_string();
            let delivery = handle.delivery();
            let metrics = handle.shutdown().await;
            outcomes.push(SinkOutcome {
                name,
                delivery,
                metrics,
            });
        }
        outcomes
    }
}

/// Convenience function to create a dispatcher from sink configs
#[instrument(name = "dispatcher_create", skip(sink_configs, input_rx))]
pub fn create_dispatcher(
    sink_configs: Vec<SinkConfig>,
    input_rx: mpsc::Receiver<MergedBatch>,
) -> Result<Dispatcher, DispatcherError> {
    let config = DispatcherConfig {
        sinks: sink_configs,
    };
    DispatcherBuilder::new(config, input_rx).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::read_records;
    use contracts::MergedRecord;
    use tempfile::tempdir;

    fn batch(window_index: u64) -> MergedBatch {
        MergedBatch {
            window_index,
            records: vec![MergedRecord {
                global_index: window_index,
                timestamp: 100 + window_index,
                channel: 1,
            }],
            missing_channels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_fanout() {
        let (input_tx, input_rx) = mpsc::channel(10);

        // Create log sinks for testing
        let sink1 = LogSink::new("sink1");
        let sink2 = LogSink::new("sink2");

        let handles = vec![
            SinkHandle::spawn(sink1, 10, Delivery::BestEffort),
            SinkHandle::spawn(sink2, 10, Delivery::BestEffort),
        ];

        let dispatcher = Dispatcher::with_handles(handles, input_rx);
        let handle = dispatcher.spawn();

        // Send some batches
        for i in 0..5 {
            input_tx.send(batch(i)).await.unwrap();
        }

        // Close input channel
        drop(input_tx);

        // Wait for dispatcher to finish
        let summary = handle.await.unwrap();
        assert_eq!(summary.batches, 5);
        assert_eq!(summary.sinks.len(), 2);
    }

    #[tokio::test]
    async fn test_session_sinks_write_artifacts() {
        let dir = tempdir().unwrap();
        let output = OutputConfig {
            dir: dir.path().to_path_buf(),
            log_sink: true,
            ..Default::default()
        };
        let names = ArtifactNames::new("master", 3);
        let config = DispatcherConfig::for_session(&output, &names, vec!["role: master".into()]);
        assert_eq!(config.sinks.len(), 3);

        let (input_tx, input_rx) = mpsc::channel(2);
        let dispatcher = create_dispatcher(config.sinks, input_rx).unwrap();
        let handle = dispatcher.spawn();
        for i in 0..20 {
            input_tx.send(batch(i)).await.unwrap();
        }
        drop(input_tx);

        let summary = handle.await.unwrap();
        summary.ensure_complete().unwrap();

        let binary = read_records(&dir.path().join(names.merged_binary())).unwrap();
        let text = read_records(&dir.path().join(names.merged_text())).unwrap();
        assert_eq!(binary.len(), 20);
        assert_eq!(binary, text);
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_creation() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let result = create_dispatcher(
            vec![SinkConfig {
                name: "merged_binary".into(),
                sink_type: SinkType::Binary {
                    path: blocker.join("out.bin"),
                    layout: RecordLayout::Tagged,
                },
                queue_capacity: 4,
            }],
            rx,
        );
        assert!(matches!(result, Err(DispatcherError::SinkCreation { .. })));
    }
}
