//! Wire framing for the control channels
//!
//! Stream channels carry `LengthDelimitedCodec` frames, datagram channels one
//! message per datagram. Payloads are bincode-encoded externally tagged enums.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

use crate::error::{CoordinatorError, Result};

pub use contracts::MAX_FRAME_BYTES;

/// Largest datagram payload
pub const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// Framed TCP stream
pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Control channel a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Trigger,
    Command,
    Status,
    Notification,
    Data,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Trigger => "trigger",
            ChannelKind::Command => "command",
            ChannelKind::Status => "status",
            ChannelKind::Notification => "notification",
            ChannelKind::Data => "data",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn framed(stream: TcpStream) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(channel: ChannelKind, message: &T) -> Result<Bytes> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| CoordinatorError::codec(channel, e.to_string()))
}

pub fn decode<T: DeserializeOwned>(channel: ChannelKind, payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| CoordinatorError::codec(channel, e.to_string()))
}

/// Send one framed message
pub async fn send<T: Serialize>(
    framed: &mut FramedStream,
    channel: ChannelKind,
    message: &T,
) -> Result<()> {
    let payload = encode(channel, message)?;
    trace!(%channel, bytes = payload.len(), "frame sent");
    framed.send(payload).await?;
    Ok(())
}

/// Receive one framed message, `None` on a clean end of stream
pub async fn recv<T: DeserializeOwned>(
    framed: &mut FramedStream,
    channel: ChannelKind,
) -> Result<Option<T>> {
    match framed.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(CoordinatorError::codec(channel, e.to_string())),
        Some(Ok(frame)) => decode(channel, &frame).map(Some),
    }
}

/// Receive one message, failing on timeout or end of stream
pub async fn recv_within<T: DeserializeOwned>(
    framed: &mut FramedStream,
    channel: ChannelKind,
    limit: Duration,
) -> Result<T> {
    match timeout(limit, recv(framed, channel)).await {
        Err(_) => Err(CoordinatorError::timeout(channel, limit)),
        Ok(Ok(None)) => Err(CoordinatorError::Closed { channel }),
        Ok(Ok(Some(message))) => Ok(message),
        Ok(Err(e)) => Err(e),
    }
}

/// Connect within `limit`
pub async fn connect(addr: impl ToSocketAddrs, channel: ChannelKind, limit: Duration) -> Result<FramedStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Err(_) => Err(CoordinatorError::timeout(channel, limit)),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(framed(stream))
        }
    }
}

/// Connect, retrying refused connections until `limit` elapses
pub async fn connect_with_retry(
    addr: &str,
    channel: ChannelKind,
    limit: Duration,
) -> Result<FramedStream> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match connect(addr, channel, remaining).await {
            Ok(framed) => return Ok(framed),
            Err(e) if Instant::now() + Duration::from_millis(20) >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
}

/// One request, one response on a fresh connection
pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
    addr: &str,
    channel: ChannelKind,
    message: &Req,
    limit: Duration,
) -> Result<Resp> {
    let deadline = Instant::now() + limit;
    let mut framed = connect(addr, channel, limit).await?;
    send(&mut framed, channel, message).await?;
    recv_within(
        &mut framed,
        channel,
        deadline.saturating_duration_since(Instant::now()),
    )
    .await
}

pub async fn send_datagram<T: Serialize>(
    socket: &UdpSocket,
    target: &str,
    channel: ChannelKind,
    message: &T,
) -> Result<usize> {
    let payload = encode(channel, message)?;
    Ok(socket.send_to(&payload, target).await?)
}

/// Wait up to `limit` for one datagram; `Ok(None)` on timeout
pub async fn recv_datagram<T: DeserializeOwned>(
    socket: &UdpSocket,
    channel: ChannelKind,
    buf: &mut [u8],
    limit: Duration,
) -> Result<Option<(T, SocketAddr)>> {
    match timeout(limit, socket.recv_from(buf)).await {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok((len, peer))) => decode(channel, &buf[..len]).map(|message| Some((message, peer))),
    }
}
