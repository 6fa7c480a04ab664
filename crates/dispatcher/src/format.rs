//! Artifact file formats
//!
//! Binary: little-endian `u64` record count, then `count` records.
//! - `Plain`:  8 bytes per record (timestamp)
//! - `Tagged`: 16 bytes per record (timestamp, channel as u64)
//!
//! The layout is detected from the file size on read.
//!
//! Text: `#`-prefixed header comments, then one `index,timestamp,channel` line per record.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use contracts::{ChannelId, MergedRecord, RecordLayout};
use tracing::{debug, instrument};

use crate::error::{DispatcherError, Result};

const COUNT_HEADER_BYTES: u64 = 8;

/// Artifact file kind, chosen by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Binary,
    Text,
}

impl FileKind {
    /// `.txt` / `.csv` are text, everything else binary
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("txt") | Some("csv") => FileKind::Text,
            _ => FileKind::Binary,
        }
    }
}

/// Streaming writer for the binary format
///
/// The count header is patched when the writer is finished.
pub struct BinaryWriter {
    writer: BufWriter<File>,
    layout: RecordLayout,
    count: u64,
}

impl BinaryWriter {
    pub fn create(path: &Path, layout: RecordLayout) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&0u64.to_le_bytes())?;
        Ok(Self {
            writer,
            layout,
            count: 0,
        })
    }

    pub fn write_record(&mut self, timestamp: u64, channel: ChannelId) -> Result<()> {
        self.writer.write_all(&timestamp.to_le_bytes())?;
        if self.layout == RecordLayout::Tagged {
            self.writer.write_all(&u64::from(channel).to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Records written so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Patch the count header and flush
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.count)
    }
}

/// Streaming writer for the text format
pub struct TextWriter {
    writer: BufWriter<File>,
    count: u64,
}

impl TextWriter {
    /// Create the file and write the header comment lines
    pub fn create(path: &Path, header: &[String]) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        for line in header {
            writeln!(writer, "# {line}")?;
        }
        writeln!(writer, "# index,timestamp,channel")?;
        Ok(Self { writer, count: 0 })
    }

    pub fn write_record(&mut self, timestamp: u64, channel: ChannelId) -> Result<()> {
        writeln!(self.writer, "{},{timestamp},{channel}", self.count)?;
        self.count += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.count)
    }
}

/// Write records as a binary file
pub fn write_binary(path: &Path, records: &[MergedRecord], layout: RecordLayout) -> Result<u64> {
    let mut writer = BinaryWriter::create(path, layout)?;
    for record in records {
        writer.write_record(record.timestamp, record.channel)?;
    }
    writer.finish()
}

/// Write records as a text file
pub fn write_text(path: &Path, records: &[MergedRecord], header: &[String]) -> Result<u64> {
    let mut writer = TextWriter::create(path, header)?;
    for record in records {
        writer.write_record(record.timestamp, record.channel)?;
    }
    writer.finish()
}

/// Read a binary file; returns the detected layout
///
/// Plain files carry no channel; records get channel 0.
#[instrument(name = "format_read_binary", skip_all, fields(path = %path.display()))]
pub fn read_binary(path: &Path) -> Result<(Vec<MergedRecord>, RecordLayout)> {
    let mut reader = BufReader::new(File::open(path)?);
    let file_len = reader.get_ref().metadata()?.len();
    if file_len < COUNT_HEADER_BYTES {
        return Err(DispatcherError::format(path, "missing record count header"));
    }

    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let count = u64::from_le_bytes(word);
    let payload = file_len - COUNT_HEADER_BYTES;

    let layout = if count.checked_mul(16) == Some(payload) {
        RecordLayout::Tagged
    } else if count.checked_mul(8) == Some(payload) {
        RecordLayout::Plain
    } else {
        return Err(DispatcherError::format(
            path,
            format!("{count} records do not match {payload} payload bytes"),
        ));
    };

    let mut records = Vec::with_capacity(count as usize);
    for global_index in 0..count {
        reader.read_exact(&mut word)?;
        let timestamp = u64::from_le_bytes(word);
        let channel = if layout == RecordLayout::Tagged {
            reader.read_exact(&mut word)?;
            let raw = u64::from_le_bytes(word);
            ChannelId::try_from(raw).map_err(|_| {
                DispatcherError::format(path, format!("channel {raw} out of range"))
            })?
        } else {
            0
        };
        records.push(MergedRecord {
            global_index,
            timestamp,
            channel,
        });
    }
    debug!(records = records.len(), ?layout, "binary file read");
    Ok((records, layout))
}

/// Read a text file
///
/// Accepts `index,timestamp,channel`, `timestamp,channel` or `timestamp` lines.
#[instrument(name = "format_read_text", skip_all, fields(path = %path.display()))]
pub fn read_text(path: &Path) -> Result<Vec<MergedRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let (timestamp, channel) = match fields.as_slice() {
            [ts] => (*ts, "0"),
            [ts, ch] => (*ts, *ch),
            [_, ts, ch] => (*ts, *ch),
            _ => {
                return Err(DispatcherError::format(
                    path,
                    format!("line {}: expected index,timestamp,channel", line_no + 1),
                ))
            }
        };
        let timestamp = timestamp.parse::<u64>().map_err(|e| {
            DispatcherError::format(path, format!("line {}: timestamp: {e}", line_no + 1))
        })?;
        let channel = channel.parse::<ChannelId>().map_err(|e| {
            DispatcherError::format(path, format!("line {}: channel: {e}", line_no + 1))
        })?;
        records.push(MergedRecord {
            global_index: records.len() as u64,
            timestamp,
            channel,
        });
    }
    debug!(records = records.len(), "text file read");
    Ok(records)
}

/// Read either format, chosen by extension
pub fn read_records(path: &Path) -> Result<Vec<MergedRecord>> {
    match FileKind::from_path(path) {
        FileKind::Text => read_text(path),
        FileKind::Binary => read_binary(path).map(|(records, _)| records),
    }
}

/// Timestamps of a file, in file order
pub fn read_timestamps(path: &Path) -> Result<Vec<u64>> {
    Ok(read_records(path)?
        .into_iter()
        .map(|record| record.timestamp)
        .collect())
}

/// Convert between formats by extension; returns the number of records
#[instrument(
    name = "format_convert",
    skip_all,
    fields(input = %input.display(), output = %output.display())
)]
pub fn convert(input: &Path, output: &Path, layout: RecordLayout) -> Result<u64> {
    let records = read_records(input)?;
    match FileKind::from_path(output) {
        FileKind::Text => write_text(
            output,
            &records,
            &[format!("converted from {}", input.display())],
        ),
        FileKind::Binary => write_binary(output, &records, layout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Vec<MergedRecord> {
        [(5u64, 2u8), (10, 1), (10, 3), (u64::MAX, 1)]
            .iter()
            .enumerate()
            .map(|(i, (timestamp, channel))| MergedRecord {
                global_index: i as u64,
                timestamp: *timestamp,
                channel: *channel,
            })
            .collect()
    }

    #[test]
    fn test_binary_layouts_detected() {
        let dir = tempdir().unwrap();

        let tagged = dir.path().join("tagged.bin");
        assert_eq!(write_binary(&tagged, &sample(), RecordLayout::Tagged).unwrap(), 4);
        assert_eq!(std::fs::metadata(&tagged).unwrap().len(), 8 + 4 * 16);
        let (records, layout) = read_binary(&tagged).unwrap();
        assert_eq!(layout, RecordLayout::Tagged);
        assert_eq!(records, sample());

        let plain = dir.path().join("plain.bin");
        write_binary(&plain, &sample(), RecordLayout::Plain).unwrap();
        let (records, layout) = read_binary(&plain).unwrap();
        assert_eq!(layout, RecordLayout::Plain);
        assert!(records.iter().all(|r| r.channel == 0));
        assert_eq!(records[3].timestamp, u64::MAX);
    }

    #[test]
    fn test_text_binary_conversion_preserves_pairs() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("merged.bin");
        let txt = dir.path().join("merged.txt");
        let back = dir.path().join("back.bin");

        write_binary(&bin, &sample(), RecordLayout::Tagged).unwrap();
        assert_eq!(convert(&bin, &txt, RecordLayout::Tagged).unwrap(), 4);
        assert_eq!(convert(&txt, &back, RecordLayout::Tagged).unwrap(), 4);

        let original = read_records(&bin).unwrap();
        let text = read_records(&txt).unwrap();
        let round = read_records(&back).unwrap();
        assert_eq!(original, text);
        assert_eq!(original, round);
    }

    #[test]
    fn test_text_header_and_short_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer.txt");
        std::fs::write(&path, "# header\n\n100,2\n200\n7,300,4\n").unwrap();
        let records = read_text(&path).unwrap();
        let pairs: Vec<(u64, ChannelId)> =
            records.iter().map(|r| (r.timestamp, r.channel)).collect();
        assert_eq!(pairs, vec![(100, 2), (200, 0), (300, 4)]);
    }

    #[test]
    fn test_truncated_binary_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut bytes = 3u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let err = read_binary(&path).unwrap_err();
        assert!(matches!(err, DispatcherError::Format { .. }));
    }

    #[test]
    fn test_bad_text_line_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "1,2,3,4\n").unwrap();
        let err = read_text(&path).unwrap_err().to_string();
        assert!(err.contains("line 1"), "got: {err}");
    }

    #[test]
    fn test_file_kind() {
        assert_eq!(FileKind::from_path(Path::new("a.TXT")), FileKind::Text);
        assert_eq!(FileKind::from_path(Path::new("a.bin")), FileKind::Binary);
        assert_eq!(FileKind::from_path(Path::new("a")), FileKind::Binary);
    }
}
