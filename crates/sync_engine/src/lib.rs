//! # Sync Engine
//!
//! 多通道时间戳合并引擎与时钟偏移估计。
//!
//! 负责：
//! - 按窗口索引合并各通道的 `ChannelBlock`
//! - 有界等待 + 通道关闭 (静默通道不会阻塞合并)
//! - 输出全局时间有序的 `MergedBatch`
//! - 偏移估计 (Mode A / Mode B) 与校正
//!
//! ## 使用示例
//!
//! ```ignore
//! use sync_engine::{StreamMerger, WindowTiming};
//!
//! let mut merger = StreamMerger::new([1, 2], WindowTiming::default(), 64);
//!
//! // Push blocks as they arrive
//! for batch in merger.push(block, Instant::now()) {
//!     // Handle merged batch
//! }
//! let (rest, summary) = merger.finish();
//! ```

mod buffer;
mod engine;
mod offset;
mod window;
mod worker;

pub use buffer::{BlockBuffer, PushOutcome};
pub use engine::StreamMerger;
pub use offset::{quality_percent, OffsetEstimator};
pub use window::WindowTiming;
pub use worker::MergeWorker;

// Re-export contracts types
pub use contracts::{MergeSummary, MergedBatch, MergedRecord, OffsetEstimate, StartAlignment};
