//! File transfer over the data channel
//!
//! `Header` → `Chunk`s in index order → `Footer`. The receiver identifies frames only by
//! variant and verifies chunk indices, chunk count and total size.

use std::path::{Path, PathBuf};
use std::time::Duration;

use contracts::{FileFrame, SyncError};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{CoordinatorError, Result};
use crate::wire::{self, ChannelKind, FramedStream};

/// A file received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name announced by the sender
    pub filename: String,
    /// Where it was stored
    pub path: PathBuf,
    pub size: u64,
}

fn failure(filename: &str, err: impl std::fmt::Display) -> CoordinatorError {
    SyncError::transfer(filename, err.to_string()).into()
}

/// Push `path` to the peer as `filename`
#[instrument(name = "file_send", skip(framed, path), fields(filename = %filename))]
pub async fn send_file(
    framed: &mut FramedStream,
    path: &Path,
    filename: &str,
    chunk_size: usize,
) -> Result<u64> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| failure(filename, format!("cannot read {}: {e}", path.display())))?;
    let size = data.len() as u64;
    let chunk_size = chunk_size.clamp(1, contracts::MAX_CHUNK_BYTES);
    let chunk_count = data.len().div_ceil(chunk_size) as u64;

    wire::send(
        framed,
        ChannelKind::Data,
        &FileFrame::Header {
            filename: filename.to_string(),
            size,
            chunk_count,
        },
    )
    .await?;

    let mut chunks_sent = 0u64;
    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        wire::send(
            framed,
            ChannelKind::Data,
            &FileFrame::Chunk {
                index: index as u64,
                data: chunk.to_vec(),
            },
        )
        .await?;
        chunks_sent += 1;
    }

    wire::send(
        framed,
        ChannelKind::Data,
        &FileFrame::Footer {
            filename: filename.to_string(),
            chunks_sent,
        },
    )
    .await?;

    observability::record_transfer_bytes("sent", size);
    info!(size, chunks = chunks_sent, "file sent");
    Ok(size)
}

/// Receive one file into `dest_dir/stored_name`
///
/// `expected` is the `(filename, size)` announced on the command channel.
#[instrument(name = "file_receive", skip(framed, dest_dir, expected, limit))]
pub async fn receive_file(
    framed: &mut FramedStream,
    dest_dir: &Path,
    stored_name: &str,
    expected: Option<(&str, u64)>,
    limit: Duration,
) -> Result<ReceivedFile> {
    let deadline = Instant::now() + limit;
    let remaining = || deadline.saturating_duration_since(Instant::now());
    let label = expected.map_or(stored_name, |(name, _)| name);

    let header: FileFrame = wire::recv_within(framed, ChannelKind::Data, remaining())
        .await
        .map_err(|e| failure(label, e))?;
    let kind = header.kind();
    let FileFrame::Header {
        filename,
        size,
        chunk_count,
    } = header
    else {
        return Err(failure(
            label,
            format!("expected header frame, got {kind}"),
        ));
    };

    if let Some((expected_name, expected_size)) = expected {
        if filename != expected_name || size != expected_size {
            return Err(failure(
                &filename,
                format!(
                    "header announces {filename} ({size} bytes), expected {expected_name} ({expected_size} bytes)"
                ),
            ));
        }
    }
    debug!(filename = %filename, size, chunk_count, "file header received");

    let capacity = usize::try_from(size).map_err(|_| failure(&filename, "file too large"))?;
    let mut data = Vec::with_capacity(capacity.min(wire::MAX_FRAME_BYTES * 4));
    let mut next_index = 0u64;

    loop {
        let frame: FileFrame = wire::recv_within(framed, ChannelKind::Data, remaining())
            .await
            .map_err(|e| failure(&filename, e))?;
        match frame {
            FileFrame::Chunk { index, data: chunk } => {
                if index != next_index {
                    return Err(failure(
                        &filename,
                        format!("chunk {index} out of order, expected {next_index}"),
                    ));
                }
                if index >= chunk_count {
                    return Err(failure(
                        &filename,
                        format!("chunk {index} beyond announced count {chunk_count}"),
                    ));
                }
                if (data.len() + chunk.len()) as u64 > size {
                    return Err(failure(&filename, "received more bytes than announced"));
                }
                data.extend_from_slice(&chunk);
                next_index += 1;
            }
            FileFrame::Footer {
                filename: footer_name,
                chunks_sent,
            } => {
                if footer_name != filename {
                    return Err(failure(
                        &filename,
                        format!("footer names {footer_name}"),
                    ));
                }
                if chunks_sent != chunk_count || next_index != chunk_count {
                    return Err(failure(
                        &filename,
                        format!(
                            "chunk count mismatch: announced {chunk_count}, sent {chunks_sent}, received {next_index}"
                        ),
                    ));
                }
                break;
            }
            FileFrame::Header { .. } => {
                return Err(failure(&filename, "unexpected second header"));
            }
        }
    }

    if data.len() as u64 != size {
        return Err(failure(
            &filename,
            format!("size mismatch: announced {size}, received {}", data.len()),
        ));
    }

    tokio::fs::create_dir_all(dest_dir).await?;
    let path = dest_dir.join(stored_name);
    tokio::fs::write(&path, &data)
        .await
        .map_err(|e| failure(&filename, format!("cannot write {}: {e}", path.display())))?;

    observability::record_transfer_bytes("received", size);
    info!(filename = %filename, size, path = %path.display(), "file received");
    Ok(ReceivedFile {
        filename,
        path,
        size,
    })
}
