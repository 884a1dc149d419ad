//! Block Manager - fixed-size blocks carved out of a single store.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bitset::BitSetTree;
use crate::common::{Error, Result};
use crate::storage::FileStore;

/// Hands out fixed-size blocks to block-resident structures.
///
/// Blocks are addressed by a `u32` index. Contents of a freshly allocated
/// block are unspecified; callers write a full block before reading it.
pub trait BlockManager: Send + Sync {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Allocate a block.
    ///
    /// # Errors
    /// `Error::NoFreeBlocks` when the manager is full.
    fn allocate_block(&self) -> Result<u32>;

    /// Return a block to the free pool.
    ///
    /// # Panics
    /// Panics if the block is not allocated.
    fn free_block(&self, index: u32);

    /// Read a whole block into `buf` (`buf.len() == block_size`).
    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()>;

    /// Overwrite a whole block (`buf.len() == block_size`).
    fn write_block(&self, index: u32, buf: &[u8]) -> Result<()>;

    /// Number of allocated blocks.
    fn blocks_in_use(&self) -> usize;
}

/// Lays blocks out back to back in one [`FileStore`].
///
/// ```text
/// ┌─────────┬─────────┬─────────┬─────────┐
/// │ Block 0 │ Block 1 │ Block 2 │  ...    │
/// └─────────┴─────────┴─────────┴─────────┘
/// Offset:  0   block_size  2×block_size
/// ```
///
/// Allocation always takes the lowest free index, keeping the store dense.
pub struct StoreBlockManager {
    store: Arc<dyn FileStore>,
    block_size: usize,
    free: Mutex<BitSetTree>,
}

impl StoreBlockManager {
    /// Create a manager of at most `max_blocks` blocks over `store`.
    ///
    /// # Panics
    /// Panics if `block_size` is 0 or `max_blocks` exceeds `u32::MAX`.
    pub fn new(store: Arc<dyn FileStore>, block_size: usize, max_blocks: usize) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        assert!(max_blocks <= u32::MAX as usize, "too many blocks");
        Self {
            store,
            block_size,
            free: Mutex::new(BitSetTree::new(max_blocks)),
        }
    }

    /// Maximum number of blocks.
    pub fn capacity(&self) -> usize {
        self.free.lock().len()
    }

    #[inline]
    fn offset(&self, index: u32) -> u64 {
        index as u64 * self.block_size as u64
    }
}

impl BlockManager for StoreBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self) -> Result<u32> {
        let mut free = self.free.lock();
        let index = free.next_clear_bit(0).ok_or(Error::NoFreeBlocks)?;
        free.set(index, true);
        Ok(index as u32)
    }

    fn free_block(&self, index: u32) {
        let was_set = self.free.lock().set(index as usize, false);
        assert!(was_set, "block {} freed twice", index);
    }

    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        let offset = self.offset(index);
        let length = self.store.length();
        if offset >= length {
            // Allocated but never written.
            buf.fill(0);
            return Ok(());
        }
        let n = self.store.read(offset, buf)?;
        buf[n..].fill(0);
        Ok(())
    }

    fn write_block(&self, index: u32, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.store.write(self.offset(index), buf)
    }

    fn blocks_in_use(&self) -> usize {
        self.free.lock().bits_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorageManager, StorageManager};

    fn create(max_blocks: usize) -> StoreBlockManager {
        let store = MemoryStorageManager::new().create_file_store("blocks").unwrap();
        StoreBlockManager::new(store, 64, max_blocks)
    }

    #[test]
    fn test_allocate_lowest_first() {
        let bm = create(8);
        assert_eq!(bm.allocate_block().unwrap(), 0);
        assert_eq!(bm.allocate_block().unwrap(), 1);
        bm.free_block(0);
        assert_eq!(bm.allocate_block().unwrap(), 0);
        assert_eq!(bm.blocks_in_use(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let bm = create(2);
        bm.allocate_block().unwrap();
        bm.allocate_block().unwrap();
        assert!(matches!(bm.allocate_block(), Err(Error::NoFreeBlocks)));
    }

    #[test]
    fn test_read_write_block() {
        let bm = create(4);
        let b = bm.allocate_block().unwrap();
        let c = bm.allocate_block().unwrap();

        bm.write_block(c, &[7u8; 64]).unwrap();
        let mut buf = [1u8; 64];
        bm.read_block(c, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 64]);

        // Block b lies before c and was never written.
        bm.read_block(b, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_panics() {
        let bm = create(4);
        let b = bm.allocate_block().unwrap();
        bm.free_block(b);
        bm.free_block(b);
    }
}
