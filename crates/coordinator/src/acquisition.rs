//! Local acquisition: listeners → merge worker → dispatcher, driven by the instrument

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use contracts::{wall_clock_ns, ChannelId, MergeSummary, MergedBatch, SessionState, SyncError};
use dispatcher::{create_dispatcher, ArtifactNames, DispatchSummary, DispatcherConfig};
use ingestion::ListenerSet;
use ::instrument::{AcquisitionPlan, InstrumentClient};
use sync_engine::MergeWorker;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::session::NodeContext;

const PROGRESS_TICK: Duration = Duration::from_millis(100);

/// One local acquisition
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub sequence_id: u64,
    pub duration: Duration,
    pub channels: Vec<ChannelId>,
    /// Master trigger time the acquisition is aligned to
    pub trigger_timestamp_ns: u64,
}

impl AcquisitionRequest {
    pub fn new(
        sequence_id: u64,
        duration_seconds: f64,
        channels: Vec<ChannelId>,
        trigger_timestamp_ns: u64,
    ) -> std::result::Result<Self, SyncError> {
        let duration = Duration::try_from_secs_f64(duration_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                SyncError::config_validation(
                    "duration_seconds",
                    format!("must be a positive number of seconds, got {duration_seconds}"),
                )
            })?;
        if channels.is_empty() {
            return Err(SyncError::config_validation(
                "channels",
                "at least one channel is required",
            ));
        }
        if channels.contains(&0) {
            return Err(SyncError::config_validation(
                "channels",
                "channel ids start at 1",
            ));
        }
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = channels.iter().find(|ch| !seen.insert(**ch)) {
            return Err(SyncError::config_validation(
                "channels",
                format!("channel {duplicate} listed more than once"),
            ));
        }
        Ok(Self {
            sequence_id,
            duration,
            channels,
            trigger_timestamp_ns,
        })
    }
}

/// Result of a local acquisition
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub sequence_id: u64,
    pub merged_binary: PathBuf,
    pub merged_text: Option<PathBuf>,
    pub summary: MergeSummary,
    pub dispatch: DispatchSummary,
    /// Stopped by a `Stop` / `Reset` / shutdown before the requested duration
    pub stopped_early: bool,
}

impl AcquisitionOutcome {
    pub fn record_count(&self) -> u64 {
        self.summary.records_emitted
    }
}

/// Tasks of a running pipeline
struct Pipeline {
    listeners: ListenerSet,
    worker: JoinHandle<MergeSummary>,
    worker_cancel: CancellationToken,
    dispatcher: JoinHandle<DispatchSummary>,
}

impl Pipeline {
    /// Wait for the worker to drain within `grace`, then stop the listeners and join everything
    async fn drain(self, grace: Duration) -> Result<(MergeSummary, DispatchSummary)> {
        let Pipeline {
            listeners,
            mut worker,
            worker_cancel,
            dispatcher,
        } = self;

        let joined = match timeout(grace, &mut worker).await {
            Ok(joined) => {
                listeners.shutdown().await;
                joined
            }
            Err(_) => {
                debug!(grace_ms = grace.as_millis() as u64, "drain grace elapsed, stopping listeners");
                listeners.shutdown().await;
                worker.await
            }
        };
        drop(worker_cancel);
        let summary = joined.map_err(|e| SyncError::Other(format!("merge worker panicked: {e}")))?;
        let dispatch = dispatcher
            .await
            .map_err(|e| SyncError::Other(format!("dispatcher panicked: {e}")))?;
        Ok((summary, dispatch))
    }

    /// Tear down after a failed start
    async fn abort(self) {
        self.worker_cancel.cancel();
        self.listeners.shutdown().await;
        if let Err(e) = self.worker.await {
            warn!(error = %e, "merge worker panicked during abort");
        }
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "dispatcher panicked during abort");
        }
    }
}

/// Run one acquisition
///
/// Binds every channel listener, starts the merge worker and the sinks, then drives the
/// instrument for the requested duration (or until `stop` fires). After the instrument
/// stops, listeners get `merge.drain_grace` to deliver their remaining blocks.
#[instrument(
    name = "local_acquisition",
    skip(ctx, instrument, request, stop),
    fields(sequence_id = request.sequence_id, role = %ctx.role())
)]
pub async fn run_acquisition<C: InstrumentClient>(
    ctx: &NodeContext,
    instrument: &C,
    request: &AcquisitionRequest,
    stop: &CancellationToken,
) -> Result<AcquisitionOutcome> {
    let blueprint = ctx.blueprint();
    let acquisition = &blueprint.acquisition;
    let sequence_id = request.sequence_id;

    let mut ports = Vec::with_capacity(request.channels.len());
    for channel in &request.channels {
        let port = acquisition.listener_port(*channel).ok_or_else(|| {
            SyncError::config_validation(
                "acquisition.listener_base_port",
                format!("listener port for channel {channel} exceeds 65535"),
            )
        })?;
        ports.push((*channel, port));
    }

    let mut listeners = ListenerSet::bind(
        &blueprint.network.bind_host,
        &ports,
        &blueprint.ingestion,
        ctx.shutdown_token(),
    )
    .await?;
    let Some(events) = listeners.take_receiver() else {
        listeners.shutdown().await;
        return Err(SyncError::Other("listener receiver already taken".into()).into());
    };

    let names = ArtifactNames::new(ctx.role(), sequence_id);
    let output = &blueprint.output;
    let sinks = DispatcherConfig::for_session(output, &names, text_header(ctx, request));
    let (batch_tx, batch_rx) = mpsc::channel::<MergedBatch>(output.queue_capacity.max(1));
    let dispatcher = match create_dispatcher(sinks.sinks, batch_rx) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            listeners.shutdown().await;
            return Err(e.into());
        }
    };

    let worker_cancel = CancellationToken::new();
    let worker = MergeWorker::new(&request.channels, acquisition, &blueprint.merge);
    let pipeline = Pipeline {
        listeners,
        worker: tokio::spawn(worker.run(events, batch_tx, worker_cancel.clone())),
        worker_cancel,
        dispatcher: dispatcher.spawn(),
    };

    let plan = AcquisitionPlan::from_config(
        sequence_id,
        blueprint.network.bind_host.clone(),
        &request.channels,
        acquisition,
    );
    if let Err(e) = start_instrument(instrument, &plan, request.trigger_timestamp_ns).await {
        error!(error = %e, "instrument start failed");
        pipeline.abort().await;
        return Err(e);
    }
    ctx.transition(sequence_id, SessionState::Acquiring);

    let stopped_early = wait_for_duration(ctx, request.duration, stop).await;

    ctx.transition(sequence_id, SessionState::Stopping);
    let stop_result = instrument.stop().await;
    if let Err(e) = &stop_result {
        error!(error = %e, "instrument stop failed");
    }

    let (summary, dispatch) = pipeline.drain(blueprint.merge.drain_grace()).await?;
    stop_result?;
    dispatch.ensure_complete()?;

    for (channel, message) in &summary.channel_failures {
        warn!(channel, message = %message, "channel failed during acquisition");
    }

    let merged_binary = output.dir.join(names.merged_binary());
    let merged_text = output.write_text.then(|| output.dir.join(names.merged_text()));
    info!(
        records = summary.records_emitted,
        windows = summary.windows_merged + summary.windows_stalled,
        stopped_early,
        path = %merged_binary.display(),
        "local acquisition finished"
    );

    Ok(AcquisitionOutcome {
        sequence_id,
        merged_binary,
        merged_text,
        summary,
        dispatch,
        stopped_early,
    })
}

async fn start_instrument<C: InstrumentClient>(
    instrument: &C,
    plan: &AcquisitionPlan,
    trigger_timestamp_ns: u64,
) -> Result<()> {
    instrument.configure(plan).await?;
    instrument.start(trigger_timestamp_ns).await?;
    Ok(())
}

/// Returns true when stopped before the duration elapsed
async fn wait_for_duration(ctx: &NodeContext, duration: Duration, stop: &CancellationToken) -> bool {
    let started = Instant::now();
    let deadline = started + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            ctx.set_progress(1.0);
            return false;
        }
        tokio::select! {
            _ = stop.cancelled() => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "acquisition stopped early");
                return true;
            }
            _ = sleep(remaining.min(PROGRESS_TICK)) => {
                ctx.set_progress(started.elapsed().as_secs_f64() / duration.as_secs_f64());
            }
        }
    }
}

fn text_header(ctx: &NodeContext, request: &AcquisitionRequest) -> Vec<String> {
    let channels: Vec<String> = request.channels.iter().map(ToString::to_string).collect();
    vec![
        "tagsync merged stream".to_string(),
        format!("role: {}", ctx.role()),
        format!("node: {}", ctx.blueprint().node.name),
        format!("sequence_id: {}", request.sequence_id),
        format!("time_unit: {}", ctx.blueprint().acquisition.time_unit.as_str()),
        format!("channels: {}", channels.join(",")),
        format!("trigger_timestamp_ns: {}", request.trigger_timestamp_ns),
        format!("written_at_ns: {}", wall_clock_ns()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::free_base_port;
    use contracts::{AcquisitionSession, NodeBlueprint, NodeRole};
    use dispatcher::read_records;
    use ::instrument::MockInstrument;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn blueprint(dir: &std::path::Path, silent: Vec<ChannelId>) -> NodeBlueprint {
        let mut blueprint = NodeBlueprint::for_role(NodeRole::Slave);
        blueprint.acquisition.channels = vec![1, 2];
        blueprint.acquisition.listener_base_port = free_base_port(2);
        blueprint.acquisition.pwid_ms = 10;
        blueprint.acquisition.dead_time_ms = 2;
        blueprint.merge.min_wait_ms = 40;
        blueprint.merge.wait_factor = 1.0;
        blueprint.merge.stall_windows = 2;
        blueprint.merge.poll_interval_ms = 5;
        blueprint.merge.drain_grace_ms = 200;
        blueprint.instrument.events_per_window = 5;
        blueprint.instrument.silent_channels = silent;
        blueprint.output.dir = dir.to_path_buf();
        blueprint
    }

    async fn run(blueprint: NodeBlueprint, stop: &CancellationToken) -> Result<AcquisitionOutcome> {
        let ctx = NodeContext::new(blueprint);
        ctx.open_session(AcquisitionSession::new(1, 0.3, BTreeSet::from([1, 2])));
        ctx.transition(1, SessionState::Triggered);

        let mut instrument = MockInstrument::new(ctx.blueprint().instrument.clone());
        instrument.connect().await.unwrap();
        let request = AcquisitionRequest::new(1, 0.3, vec![1, 2], wall_clock_ns()).unwrap();
        run_acquisition(&ctx, &instrument, &request, stop).await
    }

    #[tokio::test]
    async fn test_acquisition_writes_merged_artifacts() {
        let dir = tempdir().unwrap();
        let outcome = run(blueprint(dir.path(), Vec::new()), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.stopped_early);
        assert!(outcome.record_count() > 0);
        let records = read_records(&outcome.merged_binary).unwrap();
        assert_eq!(records.len() as u64, outcome.record_count());
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(records.iter().all(|r| r.channel == 1 || r.channel == 2));

        let text = read_records(outcome.merged_text.as_ref().unwrap()).unwrap();
        assert_eq!(text, records);
    }

    #[tokio::test]
    async fn test_silent_channel_does_not_block() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let outcome = run(blueprint(dir.path(), vec![2]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        let records = read_records(&outcome.merged_binary).unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.channel == 1));
        assert!(outcome.summary.windows_stalled > 0 || outcome.summary.closed_channels.contains(&2));
    }

    #[tokio::test]
    async fn test_stop_token_ends_early() {
        let dir = tempdir().unwrap();
        let stop = CancellationToken::new();
        stop.cancel();
        let outcome = run(blueprint(dir.path(), Vec::new()), &stop).await.unwrap();
        assert!(outcome.stopped_early);
    }

    #[tokio::test]
    async fn test_port_in_use_fails() {
        let dir = tempdir().unwrap();
        let blueprint = blueprint(dir.path(), Vec::new());
        let _holder =
            std::net::TcpListener::bind(("127.0.0.1", blueprint.acquisition.listener_base_port + 1)).unwrap();

        let err = run(blueprint, &CancellationToken::new()).await.unwrap_err();
        let err = SyncError::from(err);
        assert_eq!(err.phase(), contracts::Phase::Acquisition);
    }

    #[test]
    fn test_request_validation() {
        assert!(AcquisitionRequest::new(1, 0.0, vec![1], 0).is_err());
        assert!(AcquisitionRequest::new(1, f64::NAN, vec![1], 0).is_err());
        assert!(AcquisitionRequest::new(1, 1.0, Vec::new(), 0).is_err());
        assert!(AcquisitionRequest::new(1, 0.5, vec![1], 0).is_ok());
    }

    #[test]
    fn test_request_rejects_bad_channel_sets() {
        for channels in [vec![0], vec![1, 0], vec![1, 1], vec![2, 1, 2]] {
            let err = AcquisitionRequest::new(1, 1.0, channels.clone(), 0).unwrap_err();
            assert_eq!(err.phase(), contracts::Phase::Config, "{channels:?}");
        }
        assert!(AcquisitionRequest::new(1, 1.0, vec![3, 1, 2], 0).is_ok());
    }
}
