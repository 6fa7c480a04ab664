//! Master role: handshake, trigger, local acquisition, peer sample, estimation
//!
//! 会话编排在调用者的任务中运行；通知接收与心跳接收是常驻后台任务，
//! 随 `shutdown` 一起取消并回收。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use contracts::{
    wall_clock_ns, AcquisitionSession, ChannelId, Command, CommandResponse, NodeBlueprint,
    NodeRole, Notification, ReportArtifacts, SessionState, StatusUpdate, SyncError, SyncReport,
    TransferMode, TriggerMessage,
};
use dispatcher::{read_records, read_timestamps, ArtifactNames};
use ::instrument::InstrumentClient;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acquisition::{AcquisitionOutcome, AcquisitionRequest};
use crate::coordinator::SyncCoordinator;
use crate::estimation::{estimate_session, EstimationInputs};
use crate::role::Master;
use crate::transfer::{self, ReceivedFile};
use crate::wire::{self, ChannelKind};

const NOTIFICATION_QUEUE: usize = 64;

/// Sockets and background tasks owned by the master
pub struct MasterState {
    notifications: AsyncMutex<mpsc::Receiver<Notification>>,
    peer_status: Arc<Mutex<Option<StatusUpdate>>>,
    trigger_socket: UdpSocket,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Outcome of one master session
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Session record after completion
    pub session: AcquisitionSession,
    pub outcome: AcquisitionOutcome,
    pub report: SyncReport,
    pub report_text: PathBuf,
    pub report_json: PathBuf,
}

fn bind_error(channel: ChannelKind, addr: &str, err: std::io::Error) -> SyncError {
    SyncError::protocol(channel.as_str(), format!("cannot bind {addr}: {err}"))
}

impl<C: InstrumentClient> SyncCoordinator<Master, C> {
    /// Connect the instrument and open the notification and heartbeat endpoints
    #[instrument(name = "master_bind", skip_all, fields(node = %blueprint.node.name))]
    pub async fn bind(blueprint: NodeBlueprint, instrument: C) -> Result<Self, SyncError> {
        let (ctx, instrument) = Self::prepare(blueprint, instrument).await?;
        let network = &ctx.blueprint().network;

        let notify_addr = network.bind_addr(network.notify_port);
        let notify_listener = TcpListener::bind(&notify_addr)
            .await
            .map_err(|e| bind_error(ChannelKind::Notification, &notify_addr, e))?;
        let status_addr = network.bind_addr(network.status_port);
        let status_socket = UdpSocket::bind(&status_addr)
            .await
            .map_err(|e| bind_error(ChannelKind::Status, &status_addr, e))?;
        let trigger_source = format!("{}:0", network.bind_host);
        let trigger_socket = UdpSocket::bind(&trigger_source)
            .await
            .map_err(|e| bind_error(ChannelKind::Trigger, &trigger_source, e))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let peer_status = Arc::new(Mutex::new(None));
        let shutdown = ctx.shutdown_token().clone();
        let tasks = vec![
            tokio::spawn(notification_server(notify_listener, tx, shutdown.clone())),
            tokio::spawn(heartbeat_receiver(
                status_socket,
                Arc::clone(&peer_status),
                ctx.blueprint().status.receive_timeout(),
                shutdown,
            )),
        ];
        info!(notify = %notify_addr, status = %status_addr, "master endpoints bound");

        let state = MasterState {
            notifications: AsyncMutex::new(rx),
            peer_status,
            trigger_socket,
            tasks: Mutex::new(tasks),
        };
        Ok(Self::from_parts(ctx, instrument, state))
    }

    /// Last heartbeat received from the slave
    pub fn peer_status(&self) -> Option<StatusUpdate> {
        self.state
            .peer_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one synchronized session
    ///
    /// `None` falls back to the configured duration / channels. Failures leave the
    /// session in `Error` with a message naming the phase; the node accepts a new
    /// session afterwards.
    #[instrument(name = "master_session", skip_all)]
    pub async fn run_session(
        &self,
        duration_seconds: Option<f64>,
        channels: Option<Vec<ChannelId>>,
    ) -> Result<SessionResult, SyncError> {
        let acquisition = &self.ctx.blueprint().acquisition;
        let duration_seconds = duration_seconds.unwrap_or(acquisition.duration_seconds);
        let channels = channels.unwrap_or_else(|| acquisition.channels.clone());

        let _active = self.ctx.try_activate()?;
        let sequence_id = self.ctx.next_sequence_id();
        let channel_set: BTreeSet<ChannelId> = channels.iter().copied().collect();
        self.ctx.open_session(AcquisitionSession::new(
            sequence_id,
            duration_seconds,
            channel_set,
        ));

        match self.drive(sequence_id, duration_seconds, channels).await {
            Ok((outcome, estimation)) => {
                self.ctx.complete(sequence_id);
                let session = self.ctx.session().ok_or_else(|| {
                    SyncError::Other(format!("session {sequence_id} vanished on completion"))
                })?;
                Ok(SessionResult {
                    session,
                    outcome,
                    report: estimation.report,
                    report_text: estimation.report_text,
                    report_json: estimation.report_json,
                })
            }
            Err(err) => {
                self.ctx.fail(sequence_id, &err);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        sequence_id: u64,
        duration_seconds: f64,
        channels: Vec<ChannelId>,
    ) -> Result<(AcquisitionOutcome, crate::estimation::EstimationOutput), SyncError> {
        // Validate before anything reaches the slave
        let mut request = AcquisitionRequest::new(sequence_id, duration_seconds, channels, 0)?;
        let acquisition = &self.ctx.blueprint().acquisition;
        if let Some(channel) = request
            .channels
            .iter()
            .find(|ch| acquisition.listener_port(**ch).is_none())
        {
            return Err(SyncError::config_validation(
                "channels",
                format!(
                    "channel {channel} has no listener port above base {}",
                    acquisition.listener_base_port
                ),
            ));
        }

        self.ctx.transition(sequence_id, SessionState::Preparing);
        self.handshake(sequence_id).await?;
        self.ctx.transition(sequence_id, SessionState::ReadyForTrigger);

        let trigger = TriggerMessage {
            trigger_timestamp_ns: wall_clock_ns(),
            duration_seconds,
            channels: request.channels.clone(),
            sequence_id,
        };
        request.trigger_timestamp_ns = trigger.trigger_timestamp_ns;
        self.ctx.update_session(sequence_id, |session| {
            session.master_trigger_timestamp_ns = trigger.trigger_timestamp_ns;
        });
        self.send_trigger(&trigger).await?;
        self.ctx.transition(sequence_id, SessionState::Triggered);
        info!(
            sequence_id,
            trigger_timestamp_ns = trigger.trigger_timestamp_ns,
            "trigger sent"
        );

        let stop = self.ctx.shutdown_token().child_token();
        let (acquired, confirmed) =
            tokio::join!(self.acquire(&request, &stop), self.confirm_trigger(&trigger));
        if let Some(received_at_ns) = confirmed {
            self.ctx.update_session(sequence_id, |session| {
                session.slave_trigger_timestamp_ns = received_at_ns;
            });
        }
        let outcome = acquired?;

        let peer = self.retrieve_peer_sample(sequence_id).await?;
        let estimation = self.estimate(&outcome, &peer)?;
        Ok((outcome, estimation))
    }

    /// Handshake until the slave reports ready, bounded by
    /// `max_attempts × (request_timeout + ready_timeout)`
    #[instrument(name = "master_handshake", skip(self))]
    async fn handshake(&self, sequence_id: u64) -> Result<(), SyncError> {
        let blueprint = self.ctx.blueprint();
        let handshake = &blueprint.handshake;
        let command_addr = blueprint.network.command_addr();
        let started = Instant::now();

        let mut notifications = self.state.notifications.lock().await;
        while let Ok(stale) = notifications.try_recv() {
            debug!(notification = ?stale, "stale notification discarded");
        }

        let mut last_error = String::from("no attempt made");
        for attempt in 1..=handshake.max_attempts {
            let attempt_deadline =
                Instant::now() + handshake.request_timeout() + handshake.ready_timeout();

            let response: Result<CommandResponse, _> = wire::request(
                &command_addr,
                ChannelKind::Command,
                &Command::RequestReady { sequence_id },
                handshake.request_timeout(),
            )
            .await;
            match response {
                Ok(CommandResponse::Ack) => {
                    let ready = wait_for_notification(
                        &mut notifications,
                        handshake.ready_timeout(),
                        |n| matches!(n, Notification::ReadyForTrigger { sequence_id: s } if *s == sequence_id),
                    )
                    .await;
                    if ready.is_some() {
                        observability::record_handshake_attempt(true);
                        info!(
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "slave ready for trigger"
                        );
                        return Ok(());
                    }
                    last_error = format!(
                        "no ready_for_trigger within {}ms",
                        handshake.ready_timeout_ms
                    );
                }
                Ok(other) => last_error = format!("slave answered {other:?}"),
                Err(e) => last_error = e.to_string(),
            }

            observability::record_handshake_attempt(false);
            warn!(
                attempt,
                max_attempts = handshake.max_attempts,
                error = %last_error,
                "handshake attempt failed"
            );
            if attempt < handshake.max_attempts {
                let remaining = attempt_deadline.saturating_duration_since(Instant::now());
                self.log_peer_status(remaining.min(handshake.request_timeout()))
                    .await;
                sleep_until(attempt_deadline).await;
            }
        }

        Err(SyncError::HandshakeTimeout {
            attempts: handshake.max_attempts,
            waited_ms: started.elapsed().as_millis() as u64,
            message: last_error,
        })
    }

    async fn send_trigger(&self, trigger: &TriggerMessage) -> Result<(), SyncError> {
        let target = self.ctx.blueprint().network.trigger_addr();
        wire::send_datagram(
            &self.state.trigger_socket,
            &target,
            ChannelKind::Trigger,
            trigger,
        )
        .await?;
        Ok(())
    }

    /// Wait for `TriggerReceived`, re-sending the trigger after each grace period
    ///
    /// Returns the slave receipt timestamp when confirmed.
    async fn confirm_trigger(&self, trigger: &TriggerMessage) -> Option<u64> {
        let handshake = &self.ctx.blueprint().handshake;
        let sequence_id = trigger.sequence_id;
        let mut notifications = self.state.notifications.lock().await;

        for round in 0..=handshake.trigger_resend_attempts {
            let confirmed = wait_for_notification(
                &mut notifications,
                handshake.trigger_grace(),
                |n| matches!(n, Notification::TriggerReceived { sequence_id: s, .. } if *s == sequence_id),
            )
            .await;
            if let Some(Notification::TriggerReceived { received_at_ns, .. }) = confirmed {
                info!(sequence_id, received_at_ns, resends = round, "slave confirmed trigger");
                return Some(received_at_ns);
            }
            if round == handshake.trigger_resend_attempts {
                break;
            }

            self.log_peer_status(handshake.request_timeout()).await;
            warn!(sequence_id, resend = round + 1, "trigger not confirmed, re-sending");
            observability::record_trigger_resend();
            if let Err(e) = self.send_trigger(trigger).await {
                warn!(error = %e, "trigger re-send failed");
            }
        }

        warn!(sequence_id, "slave never confirmed the trigger");
        None
    }

    /// Poll slave status for diagnostics, falling back to the last heartbeat
    async fn log_peer_status(&self, limit: Duration) {
        let command_addr = self.ctx.blueprint().network.command_addr();
        let polled: Result<CommandResponse, _> =
            wire::request(&command_addr, ChannelKind::Command, &Command::Status, limit).await;
        match polled {
            Ok(CommandResponse::Status(report)) => info!(
                state = %report.state,
                sequence_id = ?report.sequence_id,
                active = report.acquisition_active,
                error = ?report.error_message,
                "slave status"
            ),
            Ok(other) => debug!(response = ?other, "unexpected status response"),
            Err(e) => match self.peer_status() {
                Some(update) => info!(
                    state = %update.report.state,
                    sequence_id = ?update.report.sequence_id,
                    age_ms = wall_clock_ns().saturating_sub(update.sent_at_ns) / 1_000_000,
                    poll_error = %e,
                    "slave status from last heartbeat"
                ),
                None => warn!(error = %e, "slave unreachable, no heartbeat seen"),
            },
        }
    }

    /// Request the slave sample and receive it on the data channel
    #[instrument(name = "master_retrieve", skip(self))]
    async fn retrieve_peer_sample(&self, sequence_id: u64) -> Result<ReceivedFile, SyncError> {
        let blueprint = self.ctx.blueprint();
        let network = &blueprint.network;
        let transfer_cfg = &blueprint.transfer;
        let full = blueprint.estimation.transfer == TransferMode::Full;
        let command = if full {
            Command::RequestFullData { sequence_id }
        } else {
            Command::RequestPartialData {
                sequence_id,
                fraction: blueprint.estimation.fraction,
            }
        };
        let stored_name = ArtifactNames::new(NodeRole::Master, sequence_id).peer_sample(full);

        let data_addr = network.bind_addr(network.data_port);
        let listener = TcpListener::bind(&data_addr).await.map_err(|e| {
            SyncError::transfer(&stored_name, format!("cannot bind data listener {data_addr}: {e}"))
        })?;

        let command_addr = network.command_addr();
        let deadline = Instant::now() + transfer_cfg.timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SyncError::transfer(
                    &stored_name,
                    format!("slave data not ready within {}ms", transfer_cfg.timeout_ms),
                ));
            }

            let response: Result<CommandResponse, _> = wire::request(
                &command_addr,
                ChannelKind::Command,
                &command,
                blueprint.handshake.request_timeout().min(remaining),
            )
            .await;
            match response {
                Ok(CommandResponse::TransferStarted { filename, size }) => {
                    info!(filename = %filename, size, "slave transfer started");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let (stream, peer) = timeout(remaining, listener.accept())
                        .await
                        .map_err(|_| {
                            SyncError::transfer(&filename, "slave never connected to the data port")
                        })?
                        .map_err(|e| SyncError::transfer(&filename, e.to_string()))?;
                    debug!(%peer, "data connection accepted");
                    stream.set_nodelay(true)?;
                    let mut framed = wire::framed(stream);
                    let received = transfer::receive_file(
                        &mut framed,
                        &blueprint.output.dir,
                        &stored_name,
                        Some((&filename, size)),
                        deadline.saturating_duration_since(Instant::now()),
                    )
                    .await?;
                    return Ok(received);
                }
                Ok(CommandResponse::Busy { message }) => {
                    debug!(message = %message, "slave busy, polling again");
                }
                Ok(CommandResponse::Rejected { reason }) => {
                    return Err(SyncError::transfer(
                        &stored_name,
                        format!("slave rejected data request: {reason}"),
                    ));
                }
                Ok(other) => {
                    return Err(SyncError::protocol(
                        ChannelKind::Command.as_str(),
                        format!("unexpected response to data request: {other:?}"),
                    ));
                }
                Err(e) => warn!(error = %e, "data request failed, retrying"),
            }
            sleep(transfer_cfg.poll_interval().min(remaining)).await;
        }
    }

    fn estimate(
        &self,
        outcome: &AcquisitionOutcome,
        peer: &ReceivedFile,
    ) -> Result<crate::estimation::EstimationOutput, SyncError> {
        let blueprint = self.ctx.blueprint();
        let session = self.ctx.session().unwrap_or_else(|| {
            AcquisitionSession::new(outcome.sequence_id, 0.0, BTreeSet::new())
        });
        let names = ArtifactNames::new(NodeRole::Master, outcome.sequence_id);

        let inputs = EstimationInputs {
            sequence_id: outcome.sequence_id,
            master_trigger_timestamp_ns: session.master_trigger_timestamp_ns,
            slave_trigger_timestamp_ns: session.slave_trigger_timestamp_ns,
            master: read_records(&outcome.merged_binary)?,
            peer: read_timestamps(&peer.path)?,
            peer_is_partial: blueprint.estimation.transfer == TransferMode::Partial,
            merge: outcome.summary.clone(),
            artifacts: ReportArtifacts {
                merged_binary: Some(names.merged_binary()),
                merged_text: outcome.merged_text.as_ref().map(|_| names.merged_text()),
                peer_sample: Some(
                    peer.path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| peer.filename.clone()),
                ),
                ..ReportArtifacts::default()
            },
        };
        estimate_session(
            &blueprint.estimation,
            blueprint.acquisition.time_unit,
            &blueprint.output,
            inputs,
        )
    }

    /// Cancel background tasks and wait for them
    pub async fn shutdown(self) {
        self.ctx.shutdown_token().cancel();
        let tasks = std::mem::take(
            &mut *self
                .state
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "master task panicked");
            }
        }
        self.stop_instrument().await;
        info!("master stopped");
    }
}

/// Wait up to `limit` for a notification matching `wanted`; others are discarded
async fn wait_for_notification(
    notifications: &mut mpsc::Receiver<Notification>,
    limit: Duration,
    wanted: impl Fn(&Notification) -> bool,
) -> Option<Notification> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, notifications.recv()).await {
            Ok(Some(notification)) if wanted(&notification) => return Some(notification),
            Ok(Some(other)) => debug!(notification = ?other, "notification ignored"),
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Accept slave connections and forward their notifications
async fn notification_server(
    listener: TcpListener,
    tx: mpsc::Sender<Notification>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "notification connection accepted");
                    connections.spawn(forward_notifications(
                        wire::framed(stream),
                        tx.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "notification accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

async fn forward_notifications(
    mut framed: wire::FramedStream,
    tx: mpsc::Sender<Notification>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = wire::recv::<Notification>(&mut framed, ChannelKind::Notification) => received,
        };
        match received {
            Ok(Some(notification)) => {
                debug!(notification = ?notification, "notification received");
                if tx.send(notification).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "notification frame dropped");
                return;
            }
        }
    }
}

/// Keep the last slave heartbeat
async fn heartbeat_receiver(
    socket: UdpSocket,
    peer_status: Arc<Mutex<Option<StatusUpdate>>>,
    receive_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; wire::MAX_DATAGRAM_BYTES];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = wire::recv_datagram::<StatusUpdate>(
                &socket,
                ChannelKind::Status,
                &mut buf,
                receive_timeout,
            ) => received,
        };
        match received {
            Ok(Some((update, _peer))) => {
                let mut last = peer_status.lock().unwrap_or_else(PoisonError::into_inner);
                if last.as_ref().map(|u| u.report.state) != Some(update.report.state) {
                    debug!(
                        state = %update.report.state,
                        sequence_id = ?update.report.sequence_id,
                        "slave state changed"
                    );
                }
                *last = Some(update);
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "heartbeat dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{loopback_blueprint, MockSlave};
    use ::instrument::MockInstrument;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_handshake_gives_up_without_slave() {
        let dir = tempdir().unwrap();
        let mut blueprint = loopback_blueprint(NodeRole::Master, dir.path());
        blueprint.handshake.max_attempts = 2;
        blueprint.handshake.request_timeout_ms = 50;
        blueprint.handshake.ready_timeout_ms = 50;
        let bound = blueprint.handshake.max_handshake_time();

        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument)
            .await
            .unwrap();

        let started = Instant::now();
        let err = master.run_session(Some(0.2), None).await.unwrap_err();
        assert!(started.elapsed() <= bound + Duration::from_millis(300));
        assert!(matches!(err, SyncError::HandshakeTimeout { attempts: 2, .. }));

        let session = master.session().unwrap();
        assert_eq!(session.state, SessionState::Error);
        assert!(session
            .error_message
            .unwrap()
            .starts_with("handshake failed"));
        assert_eq!(master.status().state, SessionState::Idle);
        assert!(!master.context().is_active());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_discards_stale_ready() {
        let dir = tempdir().unwrap();
        let mut blueprint = loopback_blueprint(NodeRole::Master, dir.path());
        blueprint.handshake.max_attempts = 1;
        blueprint.handshake.ready_timeout_ms = 200;
        let slave = MockSlave::start(&blueprint, |sequence_id| sequence_id + 100).await;

        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument)
            .await
            .unwrap();
        let err = master.handshake(1).await.unwrap_err();
        assert!(matches!(err, SyncError::HandshakeTimeout { attempts: 1, .. }));
        assert!(slave.requests() >= 1);
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_handshake_succeeds_on_matching_ready() {
        let dir = tempdir().unwrap();
        let blueprint = loopback_blueprint(NodeRole::Master, dir.path());
        let _slave = MockSlave::start(&blueprint, |sequence_id| sequence_id).await;

        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument)
            .await
            .unwrap();
        master.handshake(3).await.unwrap();
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_role_is_rejected() {
        let dir = tempdir().unwrap();
        let blueprint = loopback_blueprint(NodeRole::Slave, dir.path());
        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let result = SyncCoordinator::<Master, _>::bind(blueprint, instrument).await;
        assert!(matches!(result, Err(SyncError::ConfigValidation { .. })));
    }

    #[tokio::test]
    async fn test_bad_channel_set_fails_before_handshake() {
        let dir = tempdir().unwrap();
        let blueprint = loopback_blueprint(NodeRole::Master, dir.path());
        let slave = MockSlave::start(&blueprint, |sequence_id| sequence_id).await;

        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument)
            .await
            .unwrap();

        for channels in [vec![1, 1], vec![0, 2]] {
            let err = master.run_session(None, Some(channels)).await.unwrap_err();
            assert_eq!(err.phase(), contracts::Phase::Config);
            assert_eq!(master.session().unwrap().state, SessionState::Error);
        }
        assert_eq!(slave.requests(), 0);
        assert!(!master.context().is_active());
        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_busy_session_is_rejected() {
        let dir = tempdir().unwrap();
        let blueprint = loopback_blueprint(NodeRole::Master, dir.path());
        let instrument = MockInstrument::new(blueprint.instrument.clone());
        let master = SyncCoordinator::<Master, _>::bind(blueprint, instrument)
            .await
            .unwrap();

        let _held = master.context().try_activate().unwrap();
        let err = master.run_session(None, None).await.unwrap_err();
        assert!(matches!(err, SyncError::SessionBusy { .. }));
        master.shutdown().await;
    }
}
