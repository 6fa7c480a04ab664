//! ChannelStreamListener - one instrument channel
//!
//! Accepts the instrument's producer connection and turns each frame into a `ChannelBlock`.
//! Every accept / receive is bounded by the receive timeout so cancellation is observed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use contracts::{ChannelBlock, ChannelEvent, ChannelId, IngestionConfig};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::codec::decode_block;
use crate::config::IngestionMetrics;
use crate::error::{IngestionError, Result};

/// Listener for one channel
pub struct ChannelStreamListener {
    channel: ChannelId,
    listener: TcpListener,
    receive_timeout: Duration,
    max_frame_bytes: usize,
}

impl ChannelStreamListener {
    /// Bind the channel's listening socket
    pub async fn bind(channel: ChannelId, addr: &str, config: &IngestionConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IngestionError::BindFailed {
                channel,
                addr: addr.to_string(),
                source,
            })?;
        debug!(channel, addr, "channel listener bound");
        Ok(Self {
            channel,
            listener,
            receive_timeout: config.receive_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the producer closes, the listener fails or `cancel` fires
    ///
    /// Emits `Block`s in receipt order, then `Closed` on producer EOF or `Failed` on error.
    /// Nothing is emitted after cancellation.
    #[instrument(name = "channel_listener", skip_all, fields(channel = self.channel))]
    pub async fn run(
        self,
        tx: Sender<ChannelEvent>,
        metrics: Arc<IngestionMetrics>,
        cancel: CancellationToken,
    ) {
        let channel = self.channel;

        let Some(stream) = self.accept(&cancel).await else {
            return;
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                emit(&tx, &cancel, ChannelEvent::Failed {
                    channel,
                    message: e.to_string(),
                })
                .await;
                return;
            }
        };

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_bytes)
            .new_codec();
        let mut frames = FramedRead::new(stream, codec);
        let mut sequence_index: u64 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(blocks = sequence_index, "listener cancelled");
                    return;
                }
                next = timeout(self.receive_timeout, frames.next()) => next,
            };

            let event = match next {
                // receive timeout: loop to observe cancellation
                Err(_) => continue,
                Ok(None) => {
                    info!(blocks = sequence_index, "producer closed stream");
                    ChannelEvent::Closed {
                        channel,
                        blocks: sequence_index,
                    }
                }
                Ok(Some(Err(e))) => {
                    if let Some(counters) = metrics.channel(channel) {
                        counters.record_frame_error();
                    }
                    metrics::counter!("tagsync_frame_errors_total", "channel" => channel.to_string())
                        .increment(1);
                    let err = IngestionError::FrameError {
                        channel,
                        message: e.to_string(),
                    };
                    warn!(error = %err, "listener failed");
                    ChannelEvent::Failed {
                        channel,
                        message: err.to_string(),
                    }
                }
                Ok(Some(Ok(frame))) => {
                    let (timestamps, trailing) = decode_block(&frame);
                    if trailing != 0 {
                        if let Some(counters) = metrics.channel(channel) {
                            counters.record_frame_error();
                        }
                        warn!(
                            sequence_index,
                            trailing, "frame length not a multiple of 8, trailing bytes ignored"
                        );
                    }
                    if let Some(counters) = metrics.channel(channel) {
                        counters.record_block(timestamps.len());
                    }
                    metrics::counter!("tagsync_blocks_received_total", "channel" => channel.to_string())
                        .increment(1);
                    trace!(sequence_index, events = timestamps.len(), "block received");

                    let block = ChannelBlock::new(channel, sequence_index, timestamps);
                    sequence_index += 1;
                    ChannelEvent::Block(block)
                }
            };

            let terminal = !matches!(event, ChannelEvent::Block(_));
            if !emit(&tx, &cancel, event).await || terminal {
                return;
            }
            metrics.update_queue_len(tx.len());
        }
    }

    /// Wait for the producer connection; `None` when cancelled
    async fn accept(&self, cancel: &CancellationToken) -> Option<std::io::Result<TcpStream>> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("listener cancelled before producer connected");
                    return None;
                }
                accepted = timeout(self.receive_timeout, self.listener.accept()) => match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, peer))) => {
                        debug!(%peer, "producer connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(error = %e, "set_nodelay failed");
                        }
                        return Some(Ok(stream));
                    }
                    Ok(Err(e)) => return Some(Err(e)),
                },
            }
        }
    }
}

/// Send an event unless cancelled; false when the receiver is gone or cancelled
async fn emit(tx: &Sender<ChannelEvent>, cancel: &CancellationToken, event: ChannelEvent) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_block;
    use futures::SinkExt;
    use tokio_util::codec::FramedWrite;

    fn config() -> IngestionConfig {
        IngestionConfig {
            receive_timeout_ms: 20,
            max_frame_bytes: 1024,
            queue_capacity: 16,
        }
    }

    async fn spawn_listener(
        channel: ChannelId,
    ) -> (
        SocketAddr,
        async_channel::Receiver<ChannelEvent>,
        Arc<IngestionMetrics>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = ChannelStreamListener::bind(channel, "127.0.0.1:0", &config())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = async_channel::bounded(16);
        let metrics = Arc::new(IngestionMetrics::new([channel]));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listener.run(tx, metrics.clone(), cancel.clone()));
        (addr, rx, metrics, cancel, handle)
    }

    #[tokio::test]
    async fn blocks_in_receipt_order_then_closed() {
        let (addr, rx, metrics, _cancel, handle) = spawn_listener(3).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
        framed.send(encode_block(&[10, 20])).await.unwrap();
        framed.send(encode_block(&[])).await.unwrap();
        framed.send(encode_block(&[30])).await.unwrap();
        drop(framed);

        let mut events = Vec::new();
        while let Ok(event) = rx.recv().await {
            events.push(event);
        }
        handle.await.unwrap();

        assert_eq!(
            events,
            vec![
                ChannelEvent::Block(ChannelBlock::new(3, 0, vec![10, 20])),
                ChannelEvent::Block(ChannelBlock::new(3, 1, vec![])),
                ChannelEvent::Block(ChannelBlock::new(3, 2, vec![30])),
                ChannelEvent::Closed {
                    channel: 3,
                    blocks: 3
                },
            ]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.channels[&3].blocks_received, 3);
        assert_eq!(snapshot.channels[&3].timestamps_received, 3);
    }

    #[tokio::test]
    async fn oversized_frame_fails_channel() {
        let (addr, rx, metrics, _cancel, handle) = spawn_listener(1).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = FramedWrite::new(stream, LengthDelimitedCodec::new());
        let big: Vec<u64> = (0..200).collect();
        framed.send(encode_block(&big)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ChannelEvent::Failed { channel: 1, .. }));
        handle.await.unwrap();
        assert_eq!(metrics.snapshot().channels[&1].frame_errors, 1);
    }

    #[tokio::test]
    async fn cancellation_without_producer_returns() {
        let (_addr, rx, _metrics, cancel, handle) = spawn_listener(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should observe cancellation")
            .unwrap();
        assert!(rx.recv().await.is_err());
    }
}
