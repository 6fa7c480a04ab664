//! Sink implementations
//!
//! Contains BinaryFileSink, TextFileSink, and LogSink.

mod file;
mod log;

pub use self::file::{BinaryFileSink, TextFileSink};
pub use self::log::LogSink;
