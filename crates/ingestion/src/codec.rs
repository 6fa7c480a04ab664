//! Channel data frame payload
//!
//! One frame = one window of little-endian `u64` timestamps; an empty frame is an empty window.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encode timestamps as a frame payload
pub fn encode_block(timestamps: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(timestamps.len() * 8);
    for ts in timestamps {
        buf.put_u64_le(*ts);
    }
    buf.freeze()
}

/// Decode a frame payload
///
/// Returns the decoded timestamps and the number of trailing bytes that did not form a
/// complete value (non-zero means a malformed frame).
pub fn decode_block(mut payload: &[u8]) -> (Vec<u64>, usize) {
    let mut timestamps = Vec::with_capacity(payload.len() / 8);
    while payload.remaining() >= 8 {
        timestamps.push(payload.get_u64_le());
    }
    (timestamps, payload.remaining())
}
