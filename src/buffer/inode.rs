//! Inode records: block pointers and length of one stored object.
//!
//! # Record Layout (64 bytes, little-endian)
//! ```text
//! ┌──────────────────────────┬──────────┬────────┬────────────┬──────────┐
//! │ direct_blocks: [i32; 11] │ indirect │ length │ generation │ crc32    │
//! │ 44 bytes                 │ i32      │ i64    │ i32        │ u32      │
//! └──────────────────────────┴──────────┴────────┴────────────┴──────────┘
//! ```
//!
//! The checksum covers the first 60 bytes. Unused pointers hold
//! [`NO_BLOCK`]. Objects longer than 11 blocks continue through one indirect
//! block of `block_size / 4` further pointers.

use crate::common::config::{DIRECT_POINTERS, INODE_SIZE};
use crate::common::{Error, Result};

/// Pointer value for "no block".
pub const NO_BLOCK: i32 = -1;

const INDIRECT_OFFSET: usize = DIRECT_POINTERS * 4;
const LENGTH_OFFSET: usize = INDIRECT_OFFSET + 4;
const GENERATION_OFFSET: usize = LENGTH_OFFSET + 8;
const CHECKSUM_OFFSET: usize = GENERATION_OFFSET + 4;

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub direct_blocks: [i32; DIRECT_POINTERS],
    pub indirect_block: i32,
    pub length: i64,
    pub generation: i32,
}

impl Inode {
    /// An empty inode with no blocks.
    pub fn new(generation: i32) -> Self {
        Self {
            direct_blocks: [NO_BLOCK; DIRECT_POINTERS],
            indirect_block: NO_BLOCK,
            length: 0,
            generation,
        }
    }

    /// Number of data blocks the object occupies.
    pub fn block_count(&self, block_size: usize) -> usize {
        (self.length as usize).div_ceil(block_size)
    }

    /// Serialize into a 64-byte record.
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut buf = [0u8; INODE_SIZE];
        for (i, b) in self.direct_blocks.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
        }
        buf[INDIRECT_OFFSET..LENGTH_OFFSET].copy_from_slice(&self.indirect_block.to_le_bytes());
        buf[LENGTH_OFFSET..GENERATION_OFFSET].copy_from_slice(&self.length.to_le_bytes());
        buf[GENERATION_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.generation.to_le_bytes());
        let crc = crc32fast::hash(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate the record stored in inode slot `index`.
    ///
    /// # Errors
    /// `Error::CorruptInode` on a checksum mismatch, a negative length, or a
    /// missing pointer for a block the length says exists.
    pub fn decode(index: usize, buf: &[u8; INODE_SIZE], block_size: usize) -> Result<Self> {
        let corrupt = |reason: String| Error::CorruptInode {
            inode: index,
            reason,
        };
        let stored = u32::from_le_bytes(read4(buf, CHECKSUM_OFFSET));
        let actual = crc32fast::hash(&buf[..CHECKSUM_OFFSET]);
        if stored != actual {
            return Err(corrupt(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, actual
            )));
        }

        let mut direct_blocks = [NO_BLOCK; DIRECT_POINTERS];
        for (i, b) in direct_blocks.iter_mut().enumerate() {
            *b = i32::from_le_bytes(read4(buf, i * 4));
        }
        let mut length = [0u8; 8];
        length.copy_from_slice(&buf[LENGTH_OFFSET..GENERATION_OFFSET]);
        let inode = Self {
            direct_blocks,
            indirect_block: i32::from_le_bytes(read4(buf, INDIRECT_OFFSET)),
            length: i64::from_le_bytes(length),
            generation: i32::from_le_bytes(read4(buf, GENERATION_OFFSET)),
        };

        if inode.length < 0 {
            return Err(corrupt(format!("negative length {}", inode.length)));
        }
        let blocks = inode.block_count(block_size);
        if let Some(i) = (0..blocks.min(DIRECT_POINTERS)).find(|&i| inode.direct_blocks[i] < 0) {
            return Err(corrupt(format!("direct block {} missing", i)));
        }
        if blocks > DIRECT_POINTERS && inode.indirect_block < 0 {
            return Err(corrupt("indirect block missing".into()));
        }
        Ok(inode)
    }
}

#[inline]
fn read4(buf: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[at..at + 4]);
    out
}
