//! Open-addressing `i64 -> i32` hash table stored in blocks.
//!
//! The table is split into partitions, each guarded by its own lock and
//! selected by the top bits of the key's hash. A partition is a linear
//! probing table whose buckets are laid out back to back across blocks:
//!
//! ```text
//! bucket (16 bytes, little-endian)
//! ┌──────────────┬───────────┬───────────┐
//! │ key: i64     │ value: i32│ state: u32│
//! └──────────────┴───────────┴───────────┘
//!  state: 0 = empty, 1 = full, 2 = tombstone
//! ```
//!
//! Only the block list and counters of each partition live on the heap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::common::Result;
use crate::storage::BlockManager;

/// Reserved "no value" marker. Stored values must be non-negative.
///
/// Lookups return `Option` instead; the marker is what an empty or deleted
/// bucket carries in its value field.
pub const EMPTY: i32 = -1;

const BUCKET_SIZE: usize = 16;

const STATE_EMPTY: u32 = 0;
const STATE_FULL: u32 = 1;
const STATE_TOMBSTONE: u32 = 2;

// SplitMix64 finalizer.
const SPLITMIX64_MUL_1: u64 = 0xbf58476d1ce4e5b9;
const SPLITMIX64_MUL_2: u64 = 0x94d049bb133111eb;

#[inline]
fn hash(key: i64) -> u64 {
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(SPLITMIX64_MUL_1);
    x ^= x >> 27;
    x = x.wrapping_mul(SPLITMIX64_MUL_2);
    x ^ (x >> 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    key: i64,
    value: i32,
    state: u32,
}

impl Bucket {
    fn decode(buf: &[u8]) -> Self {
        let mut key = [0u8; 8];
        let mut value = [0u8; 4];
        let mut state = [0u8; 4];
        key.copy_from_slice(&buf[0..8]);
        value.copy_from_slice(&buf[8..12]);
        state.copy_from_slice(&buf[12..16]);
        Self {
            key: i64::from_le_bytes(key),
            value: i32::from_le_bytes(value),
            state: u32::from_le_bytes(state),
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.key.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value.to_le_bytes());
        buf[12..16].copy_from_slice(&self.state.to_le_bytes());
    }
}

/// Result of probing for a key.
enum Probe {
    Found { slot: usize, value: i32 },
    /// Key absent; `slot` is where it would go (first tombstone or empty).
    Vacant { slot: usize },
}

/// Block-resident partition table.
#[derive(Default)]
struct Partition {
    blocks: Vec<u32>,
    /// Number of buckets; a power of two, or 0 before the first insert.
    capacity: usize,
    len: usize,
    tombstones: usize,
}

/// Reads buckets through a one-block buffer so a probe sequence costs one
/// block read per block crossed.
struct BucketReader<'a> {
    manager: &'a dyn BlockManager,
    blocks: &'a [u32],
    buckets_per_block: usize,
    current: Option<usize>,
    buf: Vec<u8>,
}

impl<'a> BucketReader<'a> {
    fn new(manager: &'a dyn BlockManager, blocks: &'a [u32]) -> Self {
        let block_size = manager.block_size();
        Self {
            manager,
            blocks,
            buckets_per_block: block_size / BUCKET_SIZE,
            current: None,
            buf: vec![0u8; block_size],
        }
    }

    fn bucket(&mut self, slot: usize) -> Result<Bucket> {
        let block = slot / self.buckets_per_block;
        if self.current != Some(block) {
            self.manager.read_block(self.blocks[block], &mut self.buf)?;
            self.current = Some(block);
        }
        let at = (slot % self.buckets_per_block) * BUCKET_SIZE;
        Ok(Bucket::decode(&self.buf[at..at + BUCKET_SIZE]))
    }
}

impl Partition {
    fn mask(&self) -> usize {
        self.capacity - 1
    }

    fn probe(&self, manager: &dyn BlockManager, key: i64, h: u64) -> Result<Probe> {
        let mut reader = BucketReader::new(manager, &self.blocks);
        let mut slot = (h as usize) & self.mask();
        let mut first_tombstone = None;
        for _ in 0..self.capacity {
            let bucket = reader.bucket(slot)?;
            match bucket.state {
                STATE_EMPTY => {
                    return Ok(Probe::Vacant {
                        slot: first_tombstone.unwrap_or(slot),
                    })
                }
                STATE_FULL if bucket.key == key => {
                    return Ok(Probe::Found {
                        slot,
                        value: bucket.value,
                    })
                }
                STATE_TOMBSTONE if first_tombstone.is_none() => first_tombstone = Some(slot),
                _ => {}
            }
            slot = (slot + 1) & self.mask();
        }
        // Load factor keeps at least one empty bucket, so a full wrap means
        // every non-full bucket was a tombstone.
        match first_tombstone {
            Some(slot) => Ok(Probe::Vacant { slot }),
            None => unreachable!("hash partition has no free bucket"),
        }
    }

    fn write_bucket(&self, manager: &dyn BlockManager, slot: usize, bucket: Bucket) -> Result<()> {
        let buckets_per_block = manager.block_size() / BUCKET_SIZE;
        let block = self.blocks[slot / buckets_per_block];
        let mut buf = vec![0u8; manager.block_size()];
        manager.read_block(block, &mut buf)?;
        let at = (slot % buckets_per_block) * BUCKET_SIZE;
        bucket.encode(&mut buf[at..at + BUCKET_SIZE]);
        manager.write_block(block, &buf)
    }

    fn bucket_state(&self, manager: &dyn BlockManager, slot: usize) -> Result<u32> {
        Ok(BucketReader::new(manager, &self.blocks).bucket(slot)?.state)
    }

    /// Whether one more occupied bucket would cross the 0.75 load factor.
    fn needs_rehash(&self) -> bool {
        (self.len + self.tombstones + 1) * 4 > self.capacity * 3
    }

    /// Rebuild into a fresh set of blocks, dropping tombstones.
    fn rehash(&mut self, manager: &dyn BlockManager) -> Result<()> {
        let buckets_per_block = manager.block_size() / BUCKET_SIZE;
        let new_capacity = if self.capacity == 0 {
            buckets_per_block
        } else if self.tombstones >= self.len {
            self.capacity
        } else {
            self.capacity * 2
        };
        let new_blocks = allocate_blocks(manager, new_capacity.div_ceil(buckets_per_block))?;

        let mut fresh = Partition {
            blocks: new_blocks,
            capacity: new_capacity,
            len: 0,
            tombstones: 0,
        };
        let moved = self.copy_into(manager, &mut fresh);
        if let Err(e) = moved {
            for b in fresh.blocks.drain(..) {
                manager.free_block(b);
            }
            return Err(e);
        }
        trace!(
            from = self.capacity,
            to = new_capacity,
            len = fresh.len,
            "rehashed partition"
        );
        for b in self.blocks.drain(..) {
            manager.free_block(b);
        }
        *self = fresh;
        Ok(())
    }

    fn copy_into(&self, manager: &dyn BlockManager, fresh: &mut Partition) -> Result<()> {
        let buckets_per_block = manager.block_size() / BUCKET_SIZE;
        let mut buf = vec![0u8; manager.block_size()];
        // Build the new table block by block in memory, then write it out.
        let mut images = vec![vec![0u8; manager.block_size()]; fresh.blocks.len()];
        let new_mask = fresh.capacity - 1;
        for &block in &self.blocks {
            manager.read_block(block, &mut buf)?;
            for chunk in buf.chunks_exact(BUCKET_SIZE) {
                let bucket = Bucket::decode(chunk);
                if bucket.state != STATE_FULL {
                    continue;
                }
                let mut slot = (hash(bucket.key) as usize) & new_mask;
                loop {
                    let image = &mut images[slot / buckets_per_block];
                    let at = (slot % buckets_per_block) * BUCKET_SIZE;
                    if Bucket::decode(&image[at..at + BUCKET_SIZE]).state == STATE_EMPTY {
                        bucket.encode(&mut image[at..at + BUCKET_SIZE]);
                        break;
                    }
                    slot = (slot + 1) & new_mask;
                }
                fresh.len += 1;
            }
        }
        for (block, image) in fresh.blocks.iter().zip(&images) {
            manager.write_block(*block, image)?;
        }
        Ok(())
    }

    fn free(&mut self, manager: &dyn BlockManager) {
        for b in self.blocks.drain(..) {
            manager.free_block(b);
        }
        *self = Partition::default();
    }
}

/// Allocate `count` blocks, all or nothing. Contents are written by the caller.
fn allocate_blocks(manager: &dyn BlockManager, count: usize) -> Result<Vec<u32>> {
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        match manager.allocate_block() {
            Ok(b) => blocks.push(b),
            Err(e) => {
                for b in blocks {
                    manager.free_block(b);
                }
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

/// Block-resident map from object id to a non-negative physical index.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use spillcache::index::BlockClosedLongIntHashTable;
/// use spillcache::storage::{MemoryStorageManager, StorageManager, StoreBlockManager};
///
/// let store = MemoryStorageManager::new().create_file_store("index").unwrap();
/// let blocks = Arc::new(StoreBlockManager::new(store, 512, 1024));
/// let table = BlockClosedLongIntHashTable::new(blocks, 4);
///
/// assert_eq!(table.put(42, 7).unwrap(), None);
/// assert_eq!(table.get(42).unwrap(), Some(7));
/// assert_eq!(table.remove(42).unwrap(), Some(7));
/// assert_eq!(table.get(42).unwrap(), None);
/// ```
pub struct BlockClosedLongIntHashTable {
    manager: Arc<dyn BlockManager>,
    partitions: Vec<Mutex<Partition>>,
    /// Bits of the hash used to select a partition.
    partition_bits: u32,
    len: AtomicUsize,
}

impl BlockClosedLongIntHashTable {
    /// Create an empty table with about `concurrency_level` partitions.
    ///
    /// # Panics
    /// Panics if the block size is not a power of two of at least one bucket.
    pub fn new(manager: Arc<dyn BlockManager>, concurrency_level: usize) -> Self {
        let block_size = manager.block_size();
        assert!(
            block_size.is_power_of_two() && block_size >= BUCKET_SIZE,
            "block size {} cannot hold whole buckets",
            block_size
        );
        let count = concurrency_level.max(1).next_power_of_two();
        Self {
            manager,
            partitions: (0..count).map(|_| Mutex::new(Partition::default())).collect(),
            partition_bits: count.trailing_zeros(),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn partition(&self, h: u64) -> &Mutex<Partition> {
        if self.partition_bits == 0 {
            &self.partitions[0]
        } else {
            &self.partitions[(h >> (64 - self.partition_bits)) as usize]
        }
    }

    /// Look up `key`.
    pub fn get(&self, key: i64) -> Result<Option<i32>> {
        let h = hash(key);
        let part = self.partition(h).lock();
        if part.capacity == 0 {
            return Ok(None);
        }
        match part.probe(self.manager.as_ref(), key, h)? {
            Probe::Found { value, .. } => Ok(Some(value)),
            Probe::Vacant { .. } => Ok(None),
        }
    }

    /// Map `key` to `value`, returning the previous value.
    pub fn put(&self, key: i64, value: i32) -> Result<Option<i32>> {
        debug_assert!(value >= 0, "negative values are reserved, got {}", value);
        let h = hash(key);
        let manager = self.manager.as_ref();
        let mut part = self.partition(h).lock();

        if part.capacity > 0 {
            if let Probe::Found { slot, value: old } = part.probe(manager, key, h)? {
                let bucket = Bucket { key, value, state: STATE_FULL };
                part.write_bucket(manager, slot, bucket)?;
                return Ok(Some(old));
            }
        }
        if part.capacity == 0 || part.needs_rehash() {
            part.rehash(manager)?;
        }
        let Probe::Vacant { slot } = part.probe(manager, key, h)? else {
            unreachable!("key appeared while partition was locked");
        };
        let reused = part.bucket_state(manager, slot)? == STATE_TOMBSTONE;
        part.write_bucket(manager, slot, Bucket { key, value, state: STATE_FULL })?;
        if reused {
            part.tombstones -= 1;
        }
        part.len += 1;
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: i64) -> Result<Option<i32>> {
        let h = hash(key);
        let manager = self.manager.as_ref();
        let mut part = self.partition(h).lock();
        if part.capacity == 0 {
            return Ok(None);
        }
        let Probe::Found { slot, value } = part.probe(manager, key, h)? else {
            return Ok(None);
        };
        let tombstone = Bucket {
            key: 0,
            value: EMPTY,
            state: STATE_TOMBSTONE,
        };
        part.write_bucket(manager, slot, tombstone)?;
        part.len -= 1;
        part.tombstones += 1;
        if part.len == 0 {
            part.free(manager);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Blocks currently held by all partitions.
    pub fn blocks_in_use(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().blocks.len()).sum()
    }

    /// Remove every key and free every block.
    pub fn clear(&self) {
        for p in &self.partitions {
            let mut part = p.lock();
            let removed = part.len;
            part.free(self.manager.as_ref());
            self.len.fetch_sub(removed, Ordering::Relaxed);
        }
    }
}

impl Drop for BlockClosedLongIntHashTable {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorageManager, StorageManager, StoreBlockManager};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::thread;

    fn blocks() -> Arc<StoreBlockManager> {
        let store = MemoryStorageManager::new().create_file_store("index").unwrap();
        // 512-byte blocks hold 32 buckets.
        Arc::new(StoreBlockManager::new(store, 512, 1 << 14))
    }

    #[test]
    fn test_put_get_replace() {
        let table = BlockClosedLongIntHashTable::new(blocks(), 4);
        assert_eq!(table.put(1, 10).unwrap(), None);
        assert_eq!(table.put(1, 11).unwrap(), Some(10));
        assert_eq!(table.get(1).unwrap(), Some(11));
        assert_eq!(table.get(2).unwrap(), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_extreme_keys() {
        let table = BlockClosedLongIntHashTable::new(blocks(), 1);
        for (i, key) in [i64::MIN, -1, 0, i64::MAX].into_iter().enumerate() {
            table.put(key, i as i32).unwrap();
        }
        assert_eq!(table.get(i64::MIN).unwrap(), Some(0));
        assert_eq!(table.get(i64::MAX).unwrap(), Some(3));
        assert_eq!(table.get(0).unwrap(), Some(2));
    }

    #[test]
    fn test_grows_past_one_block() {
        let bm = blocks();
        let table = BlockClosedLongIntHashTable::new(bm.clone(), 1);
        for key in 0..1000 {
            table.put(key, key as i32 * 2).unwrap();
        }
        assert_eq!(table.len(), 1000);
        for key in 0..1000 {
            assert_eq!(table.get(key).unwrap(), Some(key as i32 * 2));
        }
        // 1000 keys at <= 0.75 load need at least 2048 buckets = 64 blocks.
        assert_eq!(table.blocks_in_use(), 64);
        assert_eq!(bm.blocks_in_use(), 64);
    }

    #[test]
    fn test_tombstone_churn_does_not_grow() {
        let bm = blocks();
        let table = BlockClosedLongIntHashTable::new(bm.clone(), 1);
        table.put(-5, 0).unwrap();
        for key in 0..5000 {
            table.put(key, 1).unwrap();
            assert_eq!(table.remove(key).unwrap(), Some(1));
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.blocks_in_use(), 1);
        assert_eq!(table.get(-5).unwrap(), Some(0));
    }

    #[test]
    fn test_clear_frees_blocks() {
        let bm = blocks();
        let table = BlockClosedLongIntHashTable::new(bm.clone(), 8);
        for key in 0..500 {
            table.put(key * 7919, 1).unwrap();
        }
        assert!(bm.blocks_in_use() > 0);
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(bm.blocks_in_use(), 0);
        assert_eq!(table.get(7919).unwrap(), None);
    }

    #[test]
    fn test_concurrent_disjoint_keys() {
        let table = Arc::new(BlockClosedLongIntHashTable::new(blocks(), 8));
        let handles: Vec<_> = (0..4i64)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..300 {
                        table.put(t * 1_000_000 + i, i as i32).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 1200);
        assert_eq!(table.get(3_000_299).unwrap(), Some(299));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 48, ..ProptestConfig::default() })]
        #[test]
        fn prop_matches_hash_map(
            ops in prop::collection::vec((0u8..3, -200i64..200, 0i32..1000), 0..600),
        ) {
            let table = BlockClosedLongIntHashTable::new(blocks(), 2);
            let mut model: HashMap<i64, i32> = HashMap::new();
            for (op, key, value) in ops {
                match op {
                    0 => prop_assert_eq!(table.put(key, value).unwrap(), model.insert(key, value)),
                    1 => prop_assert_eq!(table.remove(key).unwrap(), model.remove(&key)),
                    _ => prop_assert_eq!(table.get(key).unwrap(), model.get(&key).copied()),
                }
                prop_assert_eq!(table.len(), model.len());
            }
            for (key, value) in &model {
                prop_assert_eq!(table.get(*key).unwrap(), Some(*value));
            }
        }
    }
}
