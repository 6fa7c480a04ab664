//! Ingestion 错误类型

use contracts::{ChannelId, SyncError};
use thiserror::Error;

/// Ingestion 错误
#[derive(Debug, Error)]
pub enum IngestionError {
    /// 监听端口绑定失败
    #[error("failed to bind listener for channel {channel} on {addr}: {source}")]
    BindFailed {
        /// 通道
        channel: ChannelId,
        /// 监听地址
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 帧解码失败
    #[error("frame error on channel {channel}: {message}")]
    FrameError {
        /// 通道
        channel: ChannelId,
        /// 错误消息
        message: String,
    },

    /// 下游通道已关闭
    #[error("event channel closed for channel {channel}")]
    ChannelClosed {
        /// 通道
        channel: ChannelId,
    },
}

impl IngestionError {
    pub fn channel(&self) -> ChannelId {
        match self {
            IngestionError::BindFailed { channel, .. }
            | IngestionError::FrameError { channel, .. }
            | IngestionError::ChannelClosed { channel } => *channel,
        }
    }
}

impl From<IngestionError> for SyncError {
    fn from(err: IngestionError) -> Self {
        match err {
            IngestionError::BindFailed { .. } => SyncError::instrument("listen", err.to_string()),
            other => SyncError::merge_stall(other.channel(), other.to_string()),
        }
    }
}

/// Ingestion Result 类型别名
pub type Result<T> = std::result::Result<T, IngestionError>;
