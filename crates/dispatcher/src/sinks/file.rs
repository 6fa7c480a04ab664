//! File sinks - write the merged stream as binary and text artifacts

use std::fs;
use std::path::{Path, PathBuf};

use contracts::{MergedBatch, RecordLayout, RecordSink, SyncError};
use tracing::{debug, error, info, instrument};

use crate::error::DispatcherError;
use crate::format::{BinaryWriter, TextWriter};

fn create_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn sink_error(name: &str, err: DispatcherError) -> SyncError {
    SyncError::sink_write(name, err.to_string())
}

/// Sink that writes the binary artifact (count header patched on close)
pub struct BinaryFileSink {
    name: String,
    path: PathBuf,
    writer: Option<BinaryWriter>,
}

impl BinaryFileSink {
    /// Create the file (and its directory)
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        layout: RecordLayout,
    ) -> Result<Self, DispatcherError> {
        let path = path.into();
        create_parent(&path)?;
        let writer = BinaryWriter::create(&path, layout)?;
        Ok(Self {
            name: name.into(),
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_batch(&mut self, batch: &MergedBatch) -> Result<(), SyncError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SyncError::sink_write(&self.name, "sink already closed"));
        };
        for record in &batch.records {
            writer
                .write_record(record.timestamp, record.channel)
                .map_err(|e| {
                    error!(sink = %self.name, window = batch.window_index, error = %e, "Write failed");
                    sink_error(&self.name, e)
                })?;
        }
        Ok(())
    }
}

impl RecordSink for BinaryFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        level = "trace",
        name = "binary_sink_write",
        skip(self, batch),
        fields(sink = %self.name, window = batch.window_index)
    )]
    async fn write(&mut self, batch: &MergedBatch) -> Result<(), SyncError> {
        self.persist_batch(batch)
    }

    #[instrument(name = "binary_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), SyncError> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(|e| sink_error(&self.name, e)),
            None => Ok(()),
        }
    }

    #[instrument(name = "binary_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), SyncError> {
        if let Some(writer) = self.writer.take() {
            let count = writer.finish().map_err(|e| sink_error(&self.name, e))?;
            info!(sink = %self.name, path = %self.path.display(), records = count, "binary file closed");
        }
        Ok(())
    }
}

/// Sink that writes the text artifact
pub struct TextFileSink {
    name: String,
    path: PathBuf,
    writer: Option<TextWriter>,
}

impl TextFileSink {
    /// Create the file and write the header comments
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        header: &[String],
    ) -> Result<Self, DispatcherError> {
        let path = path.into();
        create_parent(&path)?;
        let writer = TextWriter::create(&path, header)?;
        Ok(Self {
            name: name.into(),
            path,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for TextFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        level = "trace",
        name = "text_sink_write",
        skip(self, batch),
        fields(sink = %self.name, window = batch.window_index)
    )]
    async fn write(&mut self, batch: &MergedBatch) -> Result<(), SyncError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SyncError::sink_write(&self.name, "sink already closed"));
        };
        for record in &batch.records {
            writer
                .write_record(record.timestamp, record.channel)
                .map_err(|e| sink_error(&self.name, e))?;
        }
        Ok(())
    }

    #[instrument(name = "text_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), SyncError> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(|e| sink_error(&self.name, e)),
            None => Ok(()),
        }
    }

    #[instrument(name = "text_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), SyncError> {
        if let Some(writer) = self.writer.take() {
            let count = writer.finish().map_err(|e| sink_error(&self.name, e))?;
            debug!(sink = %self.name, path = %self.path.display(), records = count, "text file closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{read_binary, read_text};
    use contracts::MergedRecord;
    use tempfile::tempdir;

    fn batch(window_index: u64, records: &[(u64, u8)]) -> MergedBatch {
        MergedBatch {
            window_index,
            records: records
                .iter()
                .map(|(timestamp, channel)| MergedRecord {
                    global_index: 0,
                    timestamp: *timestamp,
                    channel: *channel,
                })
                .collect(),
            missing_channels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_binary_sink_patches_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("master_1_merged.bin");

        let mut sink = BinaryFileSink::new("merged_bin", &path, RecordLayout::Tagged).unwrap();
        sink.write(&batch(0, &[(1, 1), (2, 2)])).await.unwrap();
        sink.write(&batch(1, &[])).await.unwrap();
        sink.write(&batch(2, &[(9, 1)])).await.unwrap();
        sink.flush().await.unwrap();
        sink.close().await.unwrap();

        let (records, layout) = read_binary(&path).unwrap();
        assert_eq!(layout, RecordLayout::Tagged);
        let pairs: Vec<(u64, u8)> = records.iter().map(|r| (r.timestamp, r.channel)).collect();
        assert_eq!(pairs, vec![(1, 1), (2, 2), (9, 1)]);

        assert!(sink.write(&batch(3, &[(10, 1)])).await.is_err());
    }

    #[tokio::test]
    async fn test_text_sink_writes_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master_1_merged.txt");

        let mut sink =
            TextFileSink::new("merged_txt", &path, &["role: master".to_string()]).unwrap();
        sink.write(&batch(0, &[(5, 3), (6, 1)])).await.unwrap();
        sink.close().await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# role: master\n"));
        assert!(content.contains("0,5,3\n1,6,1\n"));
        assert_eq!(read_text(&path).unwrap().len(), 2);
    }
}
