//! RecordSink trait - Dispatcher output interface
//!
//! Defines the abstract interface for Sinks.

use crate::{MergedBatch, SyncError};

/// Merged record output trait
///
/// All sink implementations must implement this trait.
#[trait_variant::make(RecordSink: Send)]
pub trait LocalRecordSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Write one merged batch
    ///
    /// # Errors
    /// Returns write error (should include context)
    async fn write(&mut self, batch: &MergedBatch) -> Result<(), SyncError>;

    /// Flush buffer (if any)
    async fn flush(&mut self) -> Result<(), SyncError>;

    /// Close sink (finalize headers, release file handles)
    async fn close(&mut self) -> Result<(), SyncError>;
}
