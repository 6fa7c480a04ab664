//! Slave role: command server, trigger receiver, heartbeat, per-trigger acquisition

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use contracts::{
    wall_clock_ns, AcquisitionSession, ChannelId, Command, CommandResponse, EstimationConfig,
    NodeBlueprint, NodeRole, Notification, SessionState, StatusUpdate, SyncError, TriggerMessage,
};
use dispatcher::{read_records, write_binary, ArtifactNames};
use ::instrument::InstrumentClient;
use sync_engine::OffsetEstimator;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::acquisition::AcquisitionRequest;
use crate::coordinator::SyncCoordinator;
use crate::role::Slave;
use crate::transfer;
use crate::wire::{self, ChannelKind};

/// Acquisition started by a trigger
struct RunningAcquisition {
    sequence_id: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Sockets and tasks owned by the slave
pub struct SlaveState {
    command_listener: Mutex<Option<TcpListener>>,
    trigger_socket: Mutex<Option<UdpSocket>>,
    heartbeat_socket: UdpSocket,
    command_addr: SocketAddr,
    trigger_addr: SocketAddr,
    acquisition: Mutex<Option<RunningAcquisition>>,
    /// `(sequence_id, received_at_ns)` of the last accepted trigger
    last_trigger: Mutex<Option<(u64, u64)>>,
    /// Ready notifications and file pushes
    background: Mutex<JoinSet<()>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: InstrumentClient> SyncCoordinator<Slave, C> {
    /// Connect the instrument and bind the command and trigger endpoints
    #[instrument(name = "slave_bind", skip_all, fields(node = %blueprint.node.name))]
    pub async fn bind(blueprint: NodeBlueprint, instrument: C) -> Result<Self, SyncError> {
        let (ctx, instrument) = Self::prepare(blueprint, instrument).await?;
        let network = &ctx.blueprint().network;

        let command_addr = network.bind_addr(network.command_port);
        let command_listener = TcpListener::bind(&command_addr).await.map_err(|e| {
            SyncError::protocol(ChannelKind::Command.as_str(), format!("cannot bind {command_addr}: {e}"))
        })?;
        let trigger_addr = network.bind_addr(network.trigger_port);
        let trigger_socket = UdpSocket::bind(&trigger_addr).await.map_err(|e| {
            SyncError::protocol(ChannelKind::Trigger.as_str(), format!("cannot bind {trigger_addr}: {e}"))
        })?;
        let heartbeat_source = format!("{}:0", network.bind_host);
        let heartbeat_socket = UdpSocket::bind(&heartbeat_source).await.map_err(|e| {
            SyncError::protocol(ChannelKind::Status.as_str(), format!("cannot bind {heartbeat_source}: {e}"))
        })?;
        info!(command = %command_addr, trigger = %trigger_addr, "slave endpoints bound");

        let state = SlaveState {
            command_addr: command_listener.local_addr()?,
            trigger_addr: trigger_socket.local_addr()?,
            command_listener: Mutex::new(Some(command_listener)),
            trigger_socket: Mutex::new(Some(trigger_socket)),
            heartbeat_socket,
            acquisition: Mutex::new(None),
            last_trigger: Mutex::new(None),
            background: Mutex::new(JoinSet::new()),
        };
        Ok(Self::from_parts(ctx, instrument, state))
    }

    pub fn command_addr(&self) -> SocketAddr {
        self.state.command_addr
    }

    pub fn trigger_addr(&self) -> SocketAddr {
        self.state.trigger_addr
    }

    /// Serve until `shutdown` fires, then stop the acquisition and join every task
    #[instrument(name = "slave_serve", skip_all, fields(node = %self.blueprint().node.name))]
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), SyncError> {
        let (Some(listener), Some(trigger_socket)) = (
            locked(&self.state.command_listener).take(),
            locked(&self.state.trigger_socket).take(),
        ) else {
            return Err(SyncError::Other("slave is already serving".into()));
        };

        let mut workers = JoinSet::new();
        workers.spawn(Arc::clone(&self).command_server(listener));
        workers.spawn(Arc::clone(&self).trigger_receiver(trigger_socket));
        workers.spawn(Arc::clone(&self).heartbeat());
        info!("slave serving");

        let node_token = self.ctx.shutdown_token().clone();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = node_token.cancelled() => {}
        }
        node_token.cancel();
        info!("slave shutting down");

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "slave worker panicked");
            }
        }
        self.stop_acquisition(true).await;
        let mut background = std::mem::take(&mut *locked(&self.state.background));
        background.shutdown().await;
        self.stop_instrument().await;
        info!("slave stopped");
        Ok(())
    }

    async fn command_server(self: Arc<Self>, listener: TcpListener) {
        let shutdown = self.ctx.shutdown_token().clone();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "command connection accepted");
                        connections.spawn(Arc::clone(&self).command_connection(stream));
                    }
                    Err(e) => warn!(error = %e, "command accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections.shutdown().await;
    }

    async fn command_connection(self: Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let mut framed = wire::framed(stream);
        let shutdown = self.ctx.shutdown_token().clone();
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return,
                received = wire::recv::<Command>(&mut framed, ChannelKind::Command) => received,
            };
            let command = match received {
                Ok(Some(command)) => command,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "command frame dropped");
                    return;
                }
            };
            let response = self.handle_command(command).await;
            if let Err(e) = wire::send(&mut framed, ChannelKind::Command, &response).await {
                warn!(error = %e, "command response not delivered");
                return;
            }
        }
    }

    /// Answer one command
    pub async fn handle_command(self: &Arc<Self>, command: Command) -> CommandResponse {
        debug!(command = ?command, "command received");
        match command {
            Command::Status => CommandResponse::Status(self.ctx.status_report()),
            Command::RequestReady { sequence_id } => self.prepare_session(sequence_id),
            Command::Stop => {
                self.stop_acquisition(false).await;
                CommandResponse::Ack
            }
            Command::Reset => {
                self.stop_acquisition(true).await;
                *locked(&self.state.last_trigger) = None;
                self.ctx.reset();
                CommandResponse::Ack
            }
            Command::RequestPartialData {
                sequence_id,
                fraction,
            } => self.start_transfer(sequence_id, Some(fraction)),
            Command::RequestFullData { sequence_id } => self.start_transfer(sequence_id, None),
        }
    }

    /// `RequestReady`: ack now, notify `ReadyForTrigger` after the settle delay
    fn prepare_session(self: &Arc<Self>, sequence_id: u64) -> CommandResponse {
        if self.ctx.is_active() {
            return CommandResponse::Busy {
                message: format!(
                    "acquisition {} in progress",
                    self.ctx.session().map_or(0, |s| s.sequence_id)
                ),
            };
        }

        match self.ctx.state_of(sequence_id) {
            // Master retry of a handshake already in progress
            Some(SessionState::Preparing | SessionState::ReadyForTrigger) => {}
            Some(state) if state.is_running() => {
                return CommandResponse::Busy {
                    message: format!("session {sequence_id} is {state}"),
                };
            }
            _ => {
                // A new master process restarts its sequence ids
                *locked(&self.state.last_trigger) = None;
                let acquisition = &self.ctx.blueprint().acquisition;
                self.ctx.open_session(AcquisitionSession::new(
                    sequence_id,
                    acquisition.duration_seconds,
                    acquisition.channels.iter().copied().collect(),
                ));
                self.ctx.transition(sequence_id, SessionState::Preparing);
            }
        }

        let this = Arc::clone(self);
        self.spawn_background(async move {
            sleep(this.ctx.blueprint().handshake.settle_delay()).await;
            if this.ctx.state_of(sequence_id) == Some(SessionState::Preparing) {
                this.ctx.transition(sequence_id, SessionState::ReadyForTrigger);
            }
            this.notify(Notification::ReadyForTrigger { sequence_id }).await;
        });
        CommandResponse::Ack
    }

    /// Send one notification on a fresh connection
    async fn notify(&self, notification: Notification) {
        let addr = self.ctx.blueprint().network.notify_addr();
        let limit = self.ctx.blueprint().handshake.request_timeout();
        let sent = async {
            let mut framed = wire::connect(&addr, ChannelKind::Notification, limit).await?;
            wire::send(&mut framed, ChannelKind::Notification, &notification).await
        }
        .await;
        match sent {
            Ok(()) => debug!(notification = ?notification, "notification sent"),
            Err(e) => warn!(error = %e, notification = ?notification, "notification not delivered"),
        }
    }

    /// Cancel the running acquisition; `wait` joins its task
    async fn stop_acquisition(&self, wait: bool) {
        let running = {
            let mut slot = locked(&self.state.acquisition);
            if let Some(running) = slot.as_ref() {
                if !running.task.is_finished() {
                    running.stop.cancel();
                    info!(sequence_id = running.sequence_id, "acquisition stop requested");
                }
            }
            let finished = slot.as_ref().is_some_and(|r| r.task.is_finished());
            if wait || finished {
                slot.take()
            } else {
                None
            }
        };
        if let Some(running) = running {
            if let Err(e) = running.task.await {
                error!(error = %e, "acquisition task panicked");
            }
        }
    }

    /// Spawn a short-lived task, reaping finished ones
    fn spawn_background(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut background = locked(&self.state.background);
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    async fn trigger_receiver(self: Arc<Self>, socket: UdpSocket) {
        let shutdown = self.ctx.shutdown_token().clone();
        let receive_timeout = self.ctx.blueprint().status.receive_timeout();
        let mut buf = vec![0u8; wire::MAX_DATAGRAM_BYTES];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = wire::recv_datagram::<TriggerMessage>(
                    &socket,
                    ChannelKind::Trigger,
                    &mut buf,
                    receive_timeout,
                ) => received,
            };
            match received {
                Ok(Some((trigger, peer))) => {
                    debug!(%peer, sequence_id = trigger.sequence_id, "trigger datagram received");
                    self.on_trigger(trigger);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "trigger datagram dropped"),
            }
        }
    }

    /// Start the acquisition for a new trigger; duplicates only re-confirm
    fn on_trigger(self: &Arc<Self>, trigger: TriggerMessage) {
        let received_at_ns = wall_clock_ns();
        let sequence_id = trigger.sequence_id;

        let last_trigger = *locked(&self.state.last_trigger);
        let duplicate = last_trigger.filter(|(last, _)| *last == sequence_id);
        if let Some((_, first_received_at_ns)) = duplicate {
            debug!(sequence_id, "duplicate trigger ignored");
            self.spawn_notify(Notification::TriggerReceived {
                sequence_id,
                received_at_ns: first_received_at_ns,
            });
            return;
        }

        let guard = match self.ctx.try_activate() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(sequence_id, error = %e, "trigger rejected");
                return;
            }
        };
        *locked(&self.state.last_trigger) = Some((sequence_id, received_at_ns));

        let channel_set: BTreeSet<ChannelId> = trigger.channels.iter().copied().collect();
        match self.ctx.state_of(sequence_id) {
            Some(state) if !state.is_terminal() => {
                self.ctx.update_session(sequence_id, |session| {
                    session.requested_duration_seconds = trigger.duration_seconds;
                    session.channel_set = channel_set;
                });
            }
            _ => self.ctx.open_session(AcquisitionSession::new(
                sequence_id,
                trigger.duration_seconds,
                channel_set,
            )),
        }
        self.ctx.update_session(sequence_id, |session| {
            session.master_trigger_timestamp_ns = trigger.trigger_timestamp_ns;
            session.slave_trigger_timestamp_ns = received_at_ns;
        });
        self.ctx.transition(sequence_id, SessionState::Triggered);
        info!(
            sequence_id,
            trigger_timestamp_ns = trigger.trigger_timestamp_ns,
            received_at_ns,
            "trigger accepted"
        );
        self.spawn_notify(Notification::TriggerReceived {
            sequence_id,
            received_at_ns,
        });

        let request = match AcquisitionRequest::new(
            sequence_id,
            trigger.duration_seconds,
            trigger.channels,
            trigger.trigger_timestamp_ns,
        ) {
            Ok(request) => request,
            Err(e) => {
                self.ctx.fail(sequence_id, &e);
                return;
            }
        };

        let stop = self.ctx.shutdown_token().child_token();
        let this = Arc::clone(self);
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let _active = guard;
            match this.acquire(&request, &task_stop).await {
                Ok(outcome) => {
                    info!(
                        sequence_id,
                        records = outcome.record_count(),
                        stopped_early = outcome.stopped_early,
                        "slave acquisition finished"
                    );
                    this.ctx.complete(sequence_id);
                }
                Err(e) => {
                    this.ctx.fail(sequence_id, &e);
                }
            }
        });
        *locked(&self.state.acquisition) = Some(RunningAcquisition {
            sequence_id,
            stop,
            task,
        });
    }

    fn spawn_notify(self: &Arc<Self>, notification: Notification) {
        let this = Arc::clone(self);
        self.spawn_background(async move { this.notify(notification).await });
    }

    /// Data request: answer now, push the file from a background task
    fn start_transfer(self: &Arc<Self>, sequence_id: u64, fraction: Option<f64>) -> CommandResponse {
        match self.ctx.state_of(sequence_id) {
            Some(state) if state.is_running() => {
                return CommandResponse::Busy {
                    message: format!("session {sequence_id} is {state}"),
                };
            }
            Some(SessionState::Error) => {
                let reason = self
                    .ctx
                    .session()
                    .and_then(|s| s.error_message)
                    .unwrap_or_else(|| "session failed".to_string());
                return CommandResponse::Rejected { reason };
            }
            Some(state @ (SessionState::Idle | SessionState::Preparing | SessionState::ReadyForTrigger)) => {
                return CommandResponse::Rejected {
                    reason: format!("session {sequence_id} was never triggered ({state})"),
                };
            }
            _ => {}
        }
        let Some(completed) = self.ctx.completed(sequence_id) else {
            return CommandResponse::Rejected {
                reason: format!("unknown session {sequence_id}"),
            };
        };

        let prepared = match fraction {
            None => Ok((completed.merged_binary.clone(), ArtifactNames::new(NodeRole::Slave, sequence_id).merged_binary())),
            Some(fraction) => self.export_partial(sequence_id, &completed.merged_binary, fraction),
        };
        let (path, filename) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(sequence_id, error = %e, "data export failed");
                return CommandResponse::Rejected {
                    reason: e.to_string(),
                };
            }
        };
        let size = match std::fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                return CommandResponse::Rejected {
                    reason: format!("cannot stat {}: {e}", path.display()),
                }
            }
        };

        let this = Arc::clone(self);
        let pushed_name = filename.clone();
        self.spawn_background(async move {
            let blueprint = this.ctx.blueprint();
            let pushed = async {
                let mut framed = wire::connect_with_retry(
                    &blueprint.network.data_addr(),
                    ChannelKind::Data,
                    blueprint.transfer.timeout(),
                )
                .await?;
                transfer::send_file(&mut framed, &path, &pushed_name, blueprint.transfer.chunk_size)
                    .await
            }
            .await;
            if let Err(e) = pushed {
                error!(sequence_id, filename = %pushed_name, error = %e, "data push failed");
            }
        });
        info!(sequence_id, filename = %filename, size, "transfer started");
        CommandResponse::TransferStarted { filename, size }
    }

    /// Write the leading `fraction` of the merged stream as its own file
    fn export_partial(
        &self,
        sequence_id: u64,
        merged: &std::path::Path,
        fraction: f64,
    ) -> Result<(PathBuf, String), SyncError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(SyncError::config_validation(
                "fraction",
                format!("must be in (0, 1], got {fraction}"),
            ));
        }
        let blueprint = self.ctx.blueprint();
        let estimator = OffsetEstimator::new(
            &EstimationConfig {
                fraction,
                ..blueprint.estimation.clone()
            },
            blueprint.acquisition.time_unit,
        );
        let records = read_records(merged)?;
        let kept = estimator.sample_len(records.len());

        let filename = ArtifactNames::new(NodeRole::Slave, sequence_id).partial_export();
        let path = blueprint.output.dir.join(&filename);
        write_binary(&path, &records[..kept], blueprint.output.layout)?;
        debug!(sequence_id, kept, total = records.len(), "partial sample exported");
        Ok((path, filename))
    }

    /// Periodic `StatusUpdate`s, plus one on every state change
    async fn heartbeat(self: Arc<Self>) {
        let shutdown = self.ctx.shutdown_token().clone();
        let target = self.ctx.blueprint().network.status_addr();
        let mut ticker = interval(self.ctx.blueprint().status.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.ctx.state_changed() => {}
            }
            let update = StatusUpdate {
                sent_at_ns: wall_clock_ns(),
                report: self.ctx.status_report(),
            };
            if let Err(e) = wire::send_datagram(
                &self.state.heartbeat_socket,
                &target,
                ChannelKind::Status,
                &update,
            )
            .await
            {
                debug!(error = %e, "heartbeat not sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::loopback_blueprint;
    use contracts::FileFrame;
    use ::instrument::MockInstrument;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;

    async fn slave(dir: &std::path::Path) -> Arc<SyncCoordinator<Slave, MockInstrument>> {
        let blueprint = loopback_blueprint(NodeRole::Slave, dir);
        let instrument = MockInstrument::new(blueprint.instrument.clone());
        Arc::new(SyncCoordinator::<Slave, _>::bind(blueprint, instrument).await.unwrap())
    }

    #[tokio::test]
    async fn test_status_and_unknown_data_request() {
        let dir = tempdir().unwrap();
        let slave = slave(dir.path()).await;

        match slave.handle_command(Command::Status).await {
            CommandResponse::Status(report) => {
                assert_eq!(report.state, SessionState::Idle);
                assert!(!report.acquisition_active);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            slave.handle_command(Command::RequestFullData { sequence_id: 9 }).await,
            CommandResponse::Rejected { .. }
        ));
    }

    #[tokio::test]
    async fn test_request_ready_notifies_after_settle() {
        let dir = tempdir().unwrap();
        let slave = slave(dir.path()).await;
        let notify = TcpListener::bind(slave.blueprint().network.bind_addr(slave.blueprint().network.notify_port))
            .await
            .unwrap();

        let response = slave
            .handle_command(Command::RequestReady { sequence_id: 4 })
            .await;
        assert_eq!(response, CommandResponse::Ack);
        assert_eq!(slave.context().state_of(4), Some(SessionState::Preparing));

        let (stream, _) = timeout(Duration::from_secs(1), notify.accept())
            .await
            .unwrap()
            .unwrap();
        let mut framed = wire::framed(stream);
        let notification: Notification = wire::recv(&mut framed, ChannelKind::Notification)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification, Notification::ReadyForTrigger { sequence_id: 4 });
        assert_eq!(slave.context().state_of(4), Some(SessionState::ReadyForTrigger));
    }

    #[tokio::test]
    async fn test_trigger_runs_acquisition_and_serves_partial_data() {
        let dir = tempdir().unwrap();
        let slave = slave(dir.path()).await;
        let network = slave.blueprint().network.clone();
        let notify = TcpListener::bind(network.bind_addr(network.notify_port))
            .await
            .unwrap();
        let data = TcpListener::bind(network.bind_addr(network.data_port))
            .await
            .unwrap();

        let trigger = TriggerMessage {
            trigger_timestamp_ns: wall_clock_ns(),
            duration_seconds: 0.3,
            channels: vec![1, 2],
            sequence_id: 1,
        };
        slave.on_trigger(trigger.clone());
        assert!(slave.context().is_active());
        assert!(matches!(
            slave.handle_command(Command::RequestReady { sequence_id: 2 }).await,
            CommandResponse::Busy { .. }
        ));
        assert!(matches!(
            slave.handle_command(Command::RequestFullData { sequence_id: 1 }).await,
            CommandResponse::Busy { .. }
        ));

        // Duplicate trigger does not start a second acquisition
        slave.on_trigger(trigger);

        let (stream, _) = notify.accept().await.unwrap();
        let mut framed = wire::framed(stream);
        let confirmed: Notification = wire::recv(&mut framed, ChannelKind::Notification)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            confirmed,
            Notification::TriggerReceived { sequence_id: 1, received_at_ns } if received_at_ns > 0
        ));

        let mut response = CommandResponse::Ack;
        for _ in 0..200 {
            response = slave
                .handle_command(Command::RequestPartialData {
                    sequence_id: 1,
                    fraction: 0.5,
                })
                .await;
            if !matches!(response, CommandResponse::Busy { .. }) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let CommandResponse::TransferStarted { filename, size } = response else {
            panic!("unexpected {response:?}");
        };
        assert_eq!(filename, "slave_1_partial.bin");
        assert_eq!(slave.context().state_of(1), Some(SessionState::Completed));

        let (stream, _) = data.accept().await.unwrap();
        let mut framed = wire::framed(stream);
        let header: FileFrame = wire::recv(&mut framed, ChannelKind::Data)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(header, FileFrame::Header { size: s, .. } if s == size));

        let merged = read_records(&dir.path().join("slave_1_merged.bin")).unwrap();
        let partial = read_records(&dir.path().join("slave_1_partial.bin")).unwrap();
        assert_eq!(partial.len(), (merged.len() / 2).max(1));
        assert_eq!(partial[..], merged[..partial.len()]);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let slave = slave(dir.path()).await;
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(Arc::clone(&slave).serve(shutdown.clone()));

        let addr = slave.command_addr().to_string();
        let response: CommandResponse = wire::request(
            &addr,
            ChannelKind::Command,
            &Command::Status,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(response, CommandResponse::Status(_)));

        shutdown.cancel();
        timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(Arc::clone(&slave).serve(CancellationToken::new()).await.is_err());
    }
}
