//! Per-channel block buffer keyed by sequence index.
//!
//! Uses index-based separation:
//! - HeapRb stores lightweight metadata (sequence index + slab key)
//! - Slab stores the timestamp vectors
//!
//! Blocks of one channel arrive in window order, so the ring is also sorted by index.

use std::fmt;

use ringbuf::{traits::*, HeapRb};
use slab::Slab;

/// Lightweight metadata stored in ring buffer
#[derive(Debug, Clone, Copy)]
struct BlockMeta {
    /// Window (sequence) index
    sequence_index: u64,
    /// Key into the slab storage
    slab_key: usize,
}

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored
    Stored,
    /// Stored after evicting the oldest block (its index)
    Evicted(u64),
    /// Index not after the last stored block, ignored
    Duplicate,
}

/// Per-channel block buffer
pub struct BlockBuffer {
    /// Ring buffer of metadata
    index: HeapRb<BlockMeta>,
    /// Timestamp storage
    storage: Slab<Vec<u64>>,
    capacity: usize,
    /// Next index this channel is expected to deliver
    next_index: u64,
    evicted_count: u64,
}

impl fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("len", &self.index.occupied_len())
            .field("capacity", &self.capacity)
            .field("next_index", &self.next_index)
            .field("evicted", &self.evicted_count)
            .finish()
    }
}

impl BlockBuffer {
    /// Create a new block buffer
    #[inline]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            index: HeapRb::new(capacity),
            storage: Slab::with_capacity(capacity),
            capacity,
            next_index: 0,
            evicted_count: 0,
        }
    }

    /// Push a block
    ///
    /// If buffer is full, evicts the oldest block.
    #[inline]
    pub fn push(&mut self, sequence_index: u64, timestamps: Vec<u64>) -> PushOutcome {
        if sequence_index < self.next_index {
            return PushOutcome::Duplicate;
        }
        self.next_index = sequence_index + 1;

        let mut outcome = PushOutcome::Stored;
        if self.index.is_full() {
            if let Some(old) = self.index.try_pop() {
                self.storage.remove(old.slab_key);
                self.evicted_count += 1;
                outcome = PushOutcome::Evicted(old.sequence_index);
            }
        }

        let slab_key = self.storage.insert(timestamps);
        let _ = self.index.try_push(BlockMeta {
            sequence_index,
            slab_key,
        });
        outcome
    }

    /// Whether the block for `sequence_index` is buffered
    #[inline]
    pub fn contains(&self, sequence_index: u64) -> bool {
        self.index
            .iter()
            .any(|meta| meta.sequence_index == sequence_index)
    }

    /// Remove and return the block for `sequence_index`
    ///
    /// Older blocks still in front of it are discarded.
    pub fn take(&mut self, sequence_index: u64) -> Option<Vec<u64>> {
        while let Some(front) = self.index.iter().next().copied() {
            if front.sequence_index > sequence_index {
                return None;
            }
            let _ = self.index.try_pop();
            let timestamps = self.storage.remove(front.slab_key);
            if front.sequence_index == sequence_index {
                return Some(timestamps);
            }
        }
        None
    }

    /// Lowest buffered index
    #[inline]
    pub fn first_index(&self) -> Option<u64> {
        self.index.iter().next().map(|meta| meta.sequence_index)
    }

    /// Buffered indices in order
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.iter().map(|meta| meta.sequence_index)
    }

    /// Next index the producer is expected to deliver
    #[inline]
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Drop every buffered block, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.index.occupied_len();
        self.index.clear();
        self.storage.clear();
        dropped
    }

    /// Get the number of blocks in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.index.occupied_len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Blocks evicted by overflow
    #[inline]
    pub fn evicted_count(&self) -> u64 {
        self.evicted_count
    }
}
