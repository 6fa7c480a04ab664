//! ListenerSet - all channel listeners of one acquisition

use std::net::SocketAddr;
use std::sync::Arc;

use async_channel::{bounded, Receiver};
use contracts::{ChannelEvent, ChannelId, IngestionConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::IngestionMetrics;
use crate::error::Result;
use crate::listener::ChannelStreamListener;

/// Listener Set
///
/// Owns one listener task per channel and the event receiver they share.
/// Sockets are owned by the tasks, so they close only after the task exits.
pub struct ListenerSet {
    /// Listener tasks
    tasks: Vec<(ChannelId, JoinHandle<()>)>,

    /// Bound addresses
    addrs: Vec<(ChannelId, SocketAddr)>,

    /// Shared metrics
    metrics: Arc<IngestionMetrics>,

    /// Event receiver
    rx: Option<Receiver<ChannelEvent>>,

    /// Child of the session token
    cancel: CancellationToken,
}

impl ListenerSet {
    /// Bind every channel listener and start its task
    ///
    /// # Errors
    /// Fails if any port cannot be bound; listeners already bound are released.
    #[instrument(
        name = "listener_set_bind",
        skip(channels, config, parent),
        fields(channels = channels.len())
    )]
    pub async fn bind(
        host: &str,
        channels: &[(ChannelId, u16)],
        config: &IngestionConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(channels.len());
        for (channel, port) in channels {
            let addr = format!("{host}:{port}");
            listeners.push(ChannelStreamListener::bind(*channel, &addr, config).await?);
        }

        let (tx, rx) = bounded(config.queue_capacity);
        let metrics = Arc::new(IngestionMetrics::new(channels.iter().map(|(ch, _)| *ch)));
        let cancel = parent.child_token();

        let mut tasks = Vec::with_capacity(listeners.len());
        let mut addrs = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let channel = listener.channel();
            if let Ok(addr) = listener.local_addr() {
                addrs.push((channel, addr));
            }
            let handle = tokio::spawn(listener.run(tx.clone(), metrics.clone(), cancel.clone()));
            tasks.push((channel, handle));
        }

        info!(count = tasks.len(), "channel listeners started");
        Ok(Self {
            tasks,
            addrs,
            metrics,
            rx: Some(rx),
            cancel,
        })
    }

    /// Get event receiver
    ///
    /// Note: Can only be called once, subsequent calls return None
    pub fn take_receiver(&mut self) -> Option<Receiver<ChannelEvent>> {
        self.rx.take()
    }

    /// Get metrics reference
    pub fn metrics(&self) -> Arc<IngestionMetrics> {
        self.metrics.clone()
    }

    /// Bound addresses per channel
    pub fn local_addrs(&self) -> &[(ChannelId, SocketAddr)] {
        &self.addrs
    }

    /// Get listener count
    pub fn listener_count(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every listener and wait for all of them to exit
    #[instrument(name = "listener_set_shutdown", skip(self))]
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (channel, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(channel, error = %e, "listener task panicked");
            } else {
                debug!(channel, "listener joined");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_block;
    use futures::SinkExt;
    use rand::Rng;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

    fn config() -> IngestionConfig {
        IngestionConfig {
            receive_timeout_ms: 20,
            max_frame_bytes: 1 << 16,
            queue_capacity: 8,
        }
    }

    #[tokio::test]
    async fn concurrent_channels_keep_per_channel_order() {
        let parent = CancellationToken::new();
        let mut set = ListenerSet::bind("127.0.0.1", &[(1, 0), (2, 0)], &config(), &parent)
            .await
            .unwrap();
        let rx = set.take_receiver().unwrap();
        assert!(set.take_receiver().is_none());

        for (channel, addr) in set.local_addrs().to_vec() {
            tokio::spawn(async move {
                let stream = TcpStream::connect(addr).await.unwrap();
                let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
                for window in 0..20u64 {
                    let n = rand::rng().random_range(0..5);
                    let block: Vec<u64> = (0..n).map(|i| window * 100 + i).collect();
                    framed.send(encode_block(&block)).await.unwrap();
                    if window % 7 == u64::from(channel) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            });
        }

        let mut next_index: BTreeMap<ChannelId, u64> = BTreeMap::new();
        let mut closed = 0;
        while closed < 2 {
            match rx.recv().await.unwrap() {
                ChannelEvent::Block(block) => {
                    let expected = next_index.entry(block.channel).or_insert(0);
                    assert_eq!(block.sequence_index, *expected);
                    *expected += 1;
                }
                ChannelEvent::Closed { blocks, .. } => {
                    assert_eq!(blocks, 20);
                    closed += 1;
                }
                ChannelEvent::Failed { message, .. } => panic!("unexpected failure: {message}"),
            }
        }

        set.shutdown().await;
        assert_eq!(next_index.values().sum::<u64>(), 40);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_idle_listeners() {
        let parent = CancellationToken::new();
        let set = ListenerSet::bind("127.0.0.1", &[(1, 0), (4, 0)], &config(), &parent)
            .await
            .unwrap();
        assert_eq!(set.listener_count(), 2);

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), set.shutdown())
            .await
            .expect("shutdown must not hang");
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let parent = CancellationToken::new();
        let first = ListenerSet::bind("127.0.0.1", &[(1, 0)], &config(), &parent)
            .await
            .unwrap();
        let port = first.local_addrs()[0].1.port();

        let err = ListenerSet::bind("127.0.0.1", &[(2, port)], &config(), &parent)
            .await
            .err()
            .expect("port already in use");
        assert_eq!(err.channel(), 2);
        first.shutdown().await;
    }
}
