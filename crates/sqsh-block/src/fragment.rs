//! Fragment packing.
//!
//! Tails (the final sub-block-size piece of a file, or a whole small file)
//! are buffered into shared fragment blocks. A fragment block that reaches
//! the data block size is handed back for submission to the block processor
//! like any other block, tagged with its fragment-table index.
//!
//! Tails themselves are deduplicated by content hash: a tail identical to
//! one already packed resolves to the existing (index, offset) pair and
//! occupies no new space.

use sqsh_tree::FragmentRef;
use std::collections::HashMap;
use tracing::trace;

/// One fragment-table entry, filled in when its block is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentEntry {
    /// Image offset of the fragment block.
    pub start: u64,
    /// On-disk size with the uncompressed flag bit.
    pub size_field: u32,
}

/// A full fragment block ready for compression.
#[derive(Debug)]
pub struct FullFragmentBlock {
    pub index: u32,
    pub data: Vec<u8>,
}

pub struct FragmentPacker {
    block_size: usize,
    current: Vec<u8>,
    /// Index the current (partially filled) block will get; assigned when
    /// the first tail lands in it.
    next_index: u32,
    tails: HashMap<(u32, usize), FragmentRef>,
}

impl FragmentPacker {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: block_size as usize,
            current: Vec::new(),
            next_index: 0,
            tails: HashMap::new(),
        }
    }

    /// Look up a previously packed identical tail.
    #[must_use]
    pub fn find_tail(&self, crc: u32, len: usize) -> Option<FragmentRef> {
        self.tails.get(&(crc, len)).copied()
    }

    /// Append a tail, returning where it lives and, when this filled the
    /// current block, the completed block to submit.
    ///
    /// `crc` must be the crc32c of `tail`; the caller computes it anyway for
    /// the dedup lookup.
    pub fn add_tail(&mut self, crc: u32, tail: &[u8]) -> (FragmentRef, Option<FullFragmentBlock>) {
        debug_assert!(tail.len() < self.block_size);

        let mut flushed = None;
        if self.current.len() + tail.len() > self.block_size {
            flushed = self.take_current();
        }

        let reference = FragmentRef {
            index: self.next_index,
            offset: self.current.len() as u32,
            tail_len: tail.len() as u32,
        };
        self.current.extend_from_slice(tail);
        self.tails.insert((crc, tail.len()), reference);
        trace!(
            target: "sqsh::fragment",
            event = "tail_packed",
            index = reference.index,
            offset = reference.offset,
            len = tail.len()
        );

        if self.current.len() == self.block_size {
            let full = self.take_current();
            debug_assert!(flushed.is_none());
            flushed = full;
        }
        (reference, flushed)
    }

    /// Emit the final partial fragment block, if any.
    pub fn flush(&mut self) -> Option<FullFragmentBlock> {
        self.take_current()
    }

    /// Number of fragment blocks started so far.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        if self.current.is_empty() {
            self.next_index
        } else {
            self.next_index + 1
        }
    }

    fn take_current(&mut self) -> Option<FullFragmentBlock> {
        if self.current.is_empty() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        Some(FullFragmentBlock {
            index,
            data: std::mem::take(&mut self.current),
        })
    }
}
