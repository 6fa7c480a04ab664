//! # Dispatcher
//!
//! 合并结果分发与产物模块。
//!
//! 负责：
//! - 消费 `MergedBatch`
//! - Fan-out 到二进制/文本文件与日志 sinks
//! - 隔离慢 sink；文件 sink 不丢批次
//! - 产物文件格式读写与同步报告

pub mod dispatcher;
pub mod error;
pub mod format;
pub mod handle;
pub mod metrics;
pub mod report;
pub mod sinks;

pub use contracts::{MergedBatch, RecordSink};
pub use dispatcher::{
    create_dispatcher, DispatchSummary, Dispatcher, DispatcherBuilder, DispatcherConfig,
    SinkConfig, SinkOutcome, SinkType,
};
pub use error::{DispatcherError, Result};
pub use format::{
    convert, read_binary, read_records, read_text, read_timestamps, write_binary, write_text,
    BinaryWriter, FileKind, TextWriter,
};
pub use handle::{Delivery, SinkHandle};
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use report::{render_text, report_timestamp, write_report, ArtifactNames};
pub use sinks::{BinaryFileSink, LogSink, TextFileSink};
