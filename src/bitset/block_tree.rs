//! Hierarchical bitmap whose leaf words live in blocks.

use std::sync::Arc;

use crate::bitset::tree::{full_word, scan_word, BitKind, Summary, WORD_BITS};
use crate::common::Result;
use crate::storage::BlockManager;

/// Hierarchical bitmap with its leaf level stored in [`BlockManager`] blocks.
///
/// Only the summary levels (1/64th of the leaf size and smaller) stay on the
/// heap. Leaf blocks are allocated the first time a bit in their range is
/// set and given back once every bit in the range is clear again, so a
/// sparse bitmap over millions of positions costs almost nothing.
///
/// Semantics match [`BitSetTree`](super::BitSetTree) exactly; every call
/// returns `Result` because leaf access is block I/O.
pub struct BlockBitSetTree {
    manager: Arc<dyn BlockManager>,
    /// Block holding each range of `words_per_block` leaf words, if any.
    blocks: Vec<Option<u32>>,
    words_per_block: usize,
    summary: Summary,
    len: usize,
    bits_set: usize,
}

impl BlockBitSetTree {
    /// Create a bitmap of `len` clear bits. No blocks are allocated yet.
    ///
    /// # Panics
    /// Panics if the manager's block size is not a multiple of 8.
    pub fn new(manager: Arc<dyn BlockManager>, len: usize) -> Self {
        let block_size = manager.block_size();
        assert!(
            block_size >= 8 && block_size % 8 == 0,
            "block size {} cannot hold whole words",
            block_size
        );
        let words_per_block = block_size / 8;
        let leaf_words = len.div_ceil(WORD_BITS);
        Self {
            manager,
            blocks: vec![None; leaf_words.div_ceil(words_per_block)],
            words_per_block,
            summary: Summary::new(leaf_words),
            len,
            bits_set: 0,
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap has zero addressable bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    pub fn bits_set(&self) -> usize {
        self.bits_set
    }

    /// Number of leaf blocks currently allocated.
    pub fn blocks_used(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Read bit `index`.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    pub fn get(&self, index: usize) -> Result<bool> {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let word = self.read_word(index / WORD_BITS)?;
        Ok(word & (1u64 << (index % WORD_BITS)) != 0)
    }

    /// Set or clear bit `index`. Returns the previous value.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: usize, value: bool) -> Result<bool> {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let w = index / WORD_BITS;
        let mask = 1u64 << (index % WORD_BITS);
        let block = w / self.words_per_block;

        let mut buf = vec![0u8; self.manager.block_size()];
        match self.blocks[block] {
            Some(b) => self.manager.read_block(b, &mut buf)?,
            None if !value => return Ok(false),
            None => {}
        }
        let at = (w % self.words_per_block) * 8;
        let before = word_at(&buf, at);
        let previous = before & mask != 0;
        if previous == value {
            return Ok(previous);
        }
        let after = if value { before | mask } else { before & !mask };
        buf[at..at + 8].copy_from_slice(&after.to_le_bytes());

        let b = match self.blocks[block] {
            Some(b) => b,
            None => {
                let b = self.manager.allocate_block()?;
                self.blocks[block] = Some(b);
                b
            }
        };
        self.manager.write_block(b, &buf)?;
        if value {
            self.bits_set += 1;
        } else {
            self.bits_set -= 1;
        }
        self.summary.update(w, after, full_word(self.len, w));

        if after == 0 && self.block_is_empty(block) {
            self.manager.free_block(b);
            self.blocks[block] = None;
        }
        Ok(previous)
    }

    /// First set bit at or after `from`.
    pub fn next_set_bit(&self, from: usize) -> Result<Option<usize>> {
        self.next(from, BitKind::Set)
    }

    /// First clear bit at or after `from`.
    pub fn next_clear_bit(&self, from: usize) -> Result<Option<usize>> {
        self.next(from, BitKind::Clear)
    }

    fn next(&self, from: usize, kind: BitKind) -> Result<Option<usize>> {
        if from >= self.len {
            return Ok(None);
        }
        let w = from / WORD_BITS;
        let mut found = scan_word(self.read_word(w)?, w, from % WORD_BITS, kind);
        if found.is_none() {
            if let Some(next) = self.summary.next_word(w + 1, kind) {
                found = scan_word(self.read_word(next)?, next, 0, kind);
            }
        }
        Ok(found.filter(|&i| i < self.len))
    }

    fn read_word(&self, w: usize) -> Result<u64> {
        let Some(b) = self.blocks[w / self.words_per_block] else {
            return Ok(0);
        };
        let mut buf = vec![0u8; self.manager.block_size()];
        self.manager.read_block(b, &mut buf)?;
        Ok(word_at(&buf, (w % self.words_per_block) * 8))
    }

    fn block_is_empty(&self, block: usize) -> bool {
        let start = block * self.words_per_block;
        let end = start + self.words_per_block;
        match self.summary.next_word(start, BitKind::Set) {
            Some(w) => w >= end,
            None => true,
        }
    }
}

impl Drop for BlockBitSetTree {
    fn drop(&mut self) {
        for b in self.blocks.iter_mut().filter_map(Option::take) {
            self.manager.free_block(b);
        }
    }
}

#[inline]
fn word_at(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}
