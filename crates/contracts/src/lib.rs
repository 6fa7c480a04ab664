//! # Contracts
//!
//! Frozen interface contracts, defining inter-module data structures and traits.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Time Model
//! - Instrument timestamps are `u64` in the configured [`TimeUnit`] (picoseconds by default)
//! - Trigger timestamps are wall-clock nanoseconds since UNIX epoch
//! - Offsets in [`OffsetEstimate`] are nanoseconds

mod block;
mod blueprint;
mod error;
mod estimate;
mod protocol;
mod session;
mod sink;
mod sync;

pub use block::*;
pub use blueprint::*;
pub use error::*;
pub use estimate::*;
pub use protocol::*;
pub use session::*;
pub use sink::*;
pub use sync::*;

/// Result alias over [`SyncError`]
pub type Result<T> = std::result::Result<T, SyncError>;
