//! Loopback fixtures shared by the coordinator tests

use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contracts::{Command, CommandResponse, NodeBlueprint, NodeRole, Notification};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::wire::{self, ChannelKind};

pub fn free_port() -> u16 {
    let socket = StdTcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

/// A base port with `channels` free ports above it
pub fn free_base_port(channels: u16) -> u16 {
    loop {
        let base = free_port();
        if base.checked_add(channels).is_some()
            && (1..=channels).all(|ch| StdTcpListener::bind(("127.0.0.1", base + ch)).is_ok())
        {
            return base;
        }
    }
}

/// Short-timing blueprint on free loopback ports
pub fn loopback_blueprint(role: NodeRole, dir: &Path) -> NodeBlueprint {
    let mut blueprint = NodeBlueprint::for_role(role);
    blueprint.network.trigger_port = free_port();
    blueprint.network.command_port = free_port();
    blueprint.network.status_port = free_port();
    blueprint.network.notify_port = free_port();
    blueprint.network.data_port = free_port();

    blueprint.acquisition.channels = vec![1, 2];
    blueprint.acquisition.duration_seconds = 0.3;
    blueprint.acquisition.listener_base_port = free_base_port(2);
    blueprint.acquisition.pwid_ms = 10;
    blueprint.acquisition.dead_time_ms = 2;

    blueprint.handshake.max_attempts = 3;
    blueprint.handshake.request_timeout_ms = 300;
    blueprint.handshake.ready_timeout_ms = 500;
    blueprint.handshake.settle_delay_ms = 10;
    blueprint.handshake.trigger_grace_ms = 150;
    blueprint.handshake.trigger_resend_attempts = 2;
    blueprint.status.heartbeat_interval_ms = 50;
    blueprint.status.receive_timeout_ms = 50;

    blueprint.merge.min_wait_ms = 40;
    blueprint.merge.wait_factor = 1.0;
    blueprint.merge.stall_windows = 2;
    blueprint.merge.poll_interval_ms = 5;
    blueprint.merge.drain_grace_ms = 200;

    blueprint.transfer.poll_interval_ms = 20;
    blueprint.transfer.timeout_ms = 5_000;
    blueprint.instrument.events_per_window = 5;
    blueprint.output.dir = dir.to_path_buf();
    blueprint
}

/// Command endpoint that acks `RequestReady` and notifies `ready_for(sequence_id)`
pub struct MockSlave {
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockSlave {
    pub async fn start(
        blueprint: &NodeBlueprint,
        ready_for: impl Fn(u64) -> u64 + Send + Sync + 'static,
    ) -> Self {
        let network = &blueprint.network;
        let listener = TcpListener::bind(network.bind_addr(network.command_port))
            .await
            .unwrap();
        let notify_addr = network.notify_addr();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut framed = wire::framed(stream);
                let Ok(Some(command)) = wire::recv::<Command>(&mut framed, ChannelKind::Command).await
                else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                match command {
                    Command::RequestReady { sequence_id } => {
                        let _ = wire::send(&mut framed, ChannelKind::Command, &CommandResponse::Ack).await;
                        let mut notify = wire::connect(
                            &notify_addr,
                            ChannelKind::Notification,
                            Duration::from_secs(1),
                        )
                        .await
                        .unwrap();
                        let ready = Notification::ReadyForTrigger {
                            sequence_id: ready_for(sequence_id),
                        };
                        let _ = wire::send(&mut notify, ChannelKind::Notification, &ready).await;
                    }
                    _ => {
                        let rejected = CommandResponse::Rejected {
                            reason: "mock slave".into(),
                        };
                        let _ = wire::send(&mut framed, ChannelKind::Command, &rejected).await;
                    }
                }
            }
        });
        Self { requests, task }
    }

    /// Commands received so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockSlave {
    fn drop(&mut self) {
        self.task.abort();
    }
}
