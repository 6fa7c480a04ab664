//! # Ingestion
//!
//! Channel stream ingestion module.
//!
//! Responsibilities:
//! - Bind one TCP listener per instrument channel (`listener_base_port + channel`)
//! - Decode length-delimited frames of little-endian `u64` timestamps into `ChannelBlock`s
//! - Emit `ChannelEvent`s to the merge worker via a bounded async-channel
//! - Per-channel counters and cooperative shutdown
//!
//! ## Usage Example
//!
//! ```ignore
//! use ingestion::ListenerSet;
//!
//! let mut listeners = ListenerSet::bind("127.0.0.1", &[(1, 48001), (2, 48002)], &config, &cancel).await?;
//! let rx = listeners.take_receiver().unwrap();
//! while let Ok(event) = rx.recv().await {
//!     // Hand to the merge worker
//! }
//! listeners.shutdown().await;
//! ```

mod codec;
mod config;
mod error;
mod listener;
mod pipeline;

// Re-exports
pub use codec::{decode_block, encode_block};
pub use config::{ChannelCounters, ChannelSnapshot, IngestionMetrics, MetricsSnapshot};
pub use contracts::{ChannelBlock, ChannelEvent};
pub use error::{IngestionError, Result};
pub use listener::ChannelStreamListener;
pub use pipeline::ListenerSet;
