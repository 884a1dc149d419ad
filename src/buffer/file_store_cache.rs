//! Inode-based object store over a [`StorageManager`].
//!
//! # Layout
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        FileStoreCache                          │
//! │  index: id ──▶ inode slot        (BlockClosedLongIntHashTable) │
//! │  inodes: 64-byte records         (ConcurrentBitSet, compact)   │
//! │  data:   block_size blocks       (BlockBitSetTree bitmap)      │
//! └────────────────────────────────────────────────────────────────┘
//!   stores:  "index"   "inodes"   "data"   "bitmap"
//! ```
//!
//! Objects are streamed from the serializer straight into data blocks and
//! streamed back out on read; no full copy of an object is ever held.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::bitset::{BlockBitSetTree, ConcurrentBitSet};
use crate::buffer::inode::{Inode, NO_BLOCK};
use crate::buffer::{CacheEntry, Serializer};
use crate::common::config::{CacheConfig, DIRECT_POINTERS, INODE_SIZE};
use crate::common::{Error, Result};
use crate::index::BlockClosedLongIntHashTable;
use crate::storage::{FileStore, StorageManager, StoreBlockManager};

/// Bucket bytes per index entry, with headroom for load factor and skew.
const INDEX_BYTES_PER_ENTRY: usize = 64;

type Group = Arc<Mutex<HashSet<i64>>>;

/// Stores serialized objects in blocks addressed through inodes.
///
/// Every stored id must belong to a cache group; removing the group frees
/// all of its objects at once.
pub struct FileStoreCache {
    block_size: usize,
    max_object_size: usize,

    inode_store: Arc<dyn FileStore>,
    data_store: Arc<dyn FileStore>,

    inodes: ConcurrentBitSet,
    data_blocks: Mutex<BlockBitSetTree>,
    index: BlockClosedLongIntHashTable,

    /// Striped locks over inode slots: readers of an object vs. its release.
    inode_locks: Vec<RwLock<()>>,
    groups: RwLock<HashMap<i64, Group>>,
    generation: AtomicI32,
}

impl FileStoreCache {
    /// Create the four backing stores on `storage` and size everything from
    /// `config`.
    pub fn new(storage: Arc<dyn StorageManager>, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size;
        let max_data_blocks = config.max_data_blocks();
        let max_inodes = max_data_blocks;

        let bitmap_blocks = max_data_blocks.div_ceil(block_size * 8);
        let bitmap = StoreBlockManager::new(storage.create_file_store("bitmap")?, block_size, bitmap_blocks);

        let index_blocks = (max_inodes * INDEX_BYTES_PER_ENTRY).div_ceil(block_size)
            + 2 * config.concurrency_level.next_power_of_two();
        let index = StoreBlockManager::new(
            storage.create_file_store("index")?,
            block_size,
            index_blocks.min(u32::MAX as usize),
        );

        let mut inodes = ConcurrentBitSet::new(max_inodes, config.concurrency_level);
        inodes.set_compact(true);

        let max_object_size = config.max_storage_object_size.min(config.inode_capacity());
        debug!(
            block_size,
            max_data_blocks, max_object_size, "created file store cache"
        );
        Ok(Self {
            block_size,
            max_object_size,
            inode_store: storage.create_file_store("inodes")?,
            data_store: storage.create_file_store("data")?,
            inodes,
            data_blocks: Mutex::new(BlockBitSetTree::new(Arc::new(bitmap), max_data_blocks)),
            index: BlockClosedLongIntHashTable::new(Arc::new(index), config.concurrency_level),
            inode_locks: (0..config.concurrency_level * 4).map(|_| RwLock::new(())).collect(),
            groups: RwLock::new(HashMap::new()),
            generation: AtomicI32::new(0),
        })
    }

    // ========================================================================
    // Cache groups
    // ========================================================================

    /// Create `group` if it does not exist yet.
    pub fn create_cache_group(&self, group: i64) {
        self.groups.write().entry(group).or_default();
    }

    /// Add `id` to `group`. Returns false if the group does not exist.
    pub fn add_to_cache_group(&self, group: i64, id: i64) -> bool {
        let members = self.groups.read().get(&group).cloned();
        match members {
            Some(members) => {
                members.lock().insert(id);
                true
            }
            None => false,
        }
    }

    /// Remove `group` and free every stored object of its members.
    ///
    /// Returns the number of objects freed. Members that were never written
    /// to this store are dropped from the group without being counted.
    pub fn remove_cache_group(&self, group: i64) -> Result<usize> {
        let Some(ids) = self.take_cache_group(group) else {
            return Ok(0);
        };
        let mut freed = 0;
        let mut first_error = None;
        for id in ids {
            match self.remove_object(id) {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(group, id, error = %e, "failed to free object");
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(group, freed, "removed cache group");
        match first_error {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }

    /// Detach `group` and return its members. Their objects stay stored.
    pub(crate) fn take_cache_group(&self, group: i64) -> Option<Vec<i64>> {
        let members = self.groups.write().remove(&group)?;
        let ids = members.lock().drain().collect();
        Some(ids)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Serialize `entry` into the store.
    ///
    /// Returns `Ok(false)` without storing anything when the serialized form
    /// exceeds [`max_object_size`](Self::max_object_size). Re-adding an id
    /// replaces the previous object and frees its blocks.
    pub fn add<T>(&self, entry: &CacheEntry<T>, serializer: &dyn Serializer<T>) -> Result<bool> {
        self.write_object(entry.id, |out| serializer.serialize(&entry.payload, out))
    }

    /// Store already serialized bytes under `id`.
    pub fn add_bytes(&self, id: i64, bytes: &[u8]) -> Result<bool> {
        if bytes.len() > self.max_object_size {
            return Ok(false);
        }
        self.write_object(id, |out| out.write_all(bytes).map_err(Error::from))
    }

    /// Store `length` bytes read from `input` under `id`.
    pub(crate) fn add_stream(&self, id: i64, length: usize, input: &mut dyn Read) -> Result<bool> {
        if length > self.max_object_size {
            return Ok(false);
        }
        self.write_object(id, |out| {
            io::copy(input, out)?;
            Ok(())
        })
    }

    /// Free the object stored under `id`. Returns false if there was none.
    pub(crate) fn remove_object(&self, id: i64) -> Result<bool> {
        match self.index.remove(id)? {
            Some(slot) => {
                self.free_inode(slot as usize)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read and deserialize the object stored under `id`, if any.
    pub fn get<T>(&self, id: i64, serializer: &dyn Serializer<T>) -> Result<Option<CacheEntry<T>>> {
        loop {
            let Some(slot) = self.index.get(id)? else {
                return Ok(None);
            };
            let slot = slot as usize;
            let _guard = self.inode_lock(slot).read();
            // The id may have been rewritten or removed before the lock.
            if self.index.get(id)? != Some(slot as i32) {
                continue;
            }
            let inode = self.read_inode(slot)?;
            trace!(id, slot, length = inode.length, "reading object");
            let mut reader = BlockReader::new(self, &inode)?;
            return match serializer.deserialize(&mut reader) {
                Ok(payload) => Ok(Some(CacheEntry::new(id, payload))),
                Err(e) => Err(reader.failure.take().unwrap_or(e)),
            };
        }
    }

    /// Whether an object is stored under `id`.
    pub fn contains(&self, id: i64) -> Result<bool> {
        Ok(self.index.get(id)?.is_some())
    }

    // ========================================================================
    // Observability and maintenance
    // ========================================================================

    /// Data blocks allocated, indirect blocks included.
    pub fn data_blocks_in_use(&self) -> usize {
        self.data_blocks.lock().bits_set()
    }

    /// Inode slots allocated.
    pub fn inodes_in_use(&self) -> usize {
        self.inodes.bits_set()
    }

    /// Largest object the store accepts.
    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Shrink the inode store to just past the highest live inode.
    ///
    /// Returns the new length in bytes. Must not run concurrently with
    /// `add`, `add_bytes` or `remove_cache_group`.
    pub fn truncate_inode_store(&self) -> Result<u64> {
        let highest = (0..self.inodes.segment_count())
            .filter_map(|s| self.inodes.compact_highest_bit_set(s))
            .max();
        let length = highest.map_or(0, |h| (h as u64 + 1) * INODE_SIZE as u64);
        if length < self.inode_store.length() {
            self.inode_store.set_length(length)?;
            debug!(length, "truncated inode store");
        }
        Ok(length)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn write_object<F>(&self, id: i64, fill: F) -> Result<bool>
    where
        F: FnOnce(&mut BlockWriter<'_>) -> Result<()>,
    {
        let mut writer = BlockWriter::new(self);
        let filled = fill(&mut writer);
        // A serializer may swallow a writer error (an unflushed BufWriter,
        // for one), so the writer's own state decides.
        if writer.too_large {
            debug!(id, max = self.max_object_size, "object too large for store");
            return Ok(false);
        }
        if let Some(e) = writer.failure.take() {
            return Err(e);
        }
        filled?;
        let inode = writer.finish()?;
        let replaced = self.store_inode(id, &inode)?;
        writer.commit();
        trace!(id, length = inode.length, "stored object");
        if let Some(old) = replaced {
            self.free_inode(old)?;
        }
        Ok(true)
    }

    /// Write `inode` to a fresh slot and point `id` at it. Returns the slot
    /// previously mapped to `id`.
    fn store_inode(&self, id: i64, inode: &Inode) -> Result<Option<usize>> {
        // Lowest free slot first so truncation can shrink the store.
        let slot = self
            .inodes
            .get_and_set_next_clear_bit_from(0)
            .ok_or(Error::NoFreeInodes)?;
        let stored = self
            .inode_store
            .write((slot * INODE_SIZE) as u64, &inode.encode())
            .and_then(|_| self.index.put(id, slot as i32));
        match stored {
            Ok(old) => Ok(old.map(|s| s as usize)),
            Err(e) => {
                self.inodes.clear(slot);
                Err(e)
            }
        }
    }

    fn read_inode(&self, slot: usize) -> Result<Inode> {
        let mut buf = [0u8; INODE_SIZE];
        self.inode_store.read_fully((slot * INODE_SIZE) as u64, &mut buf)?;
        Inode::decode(slot, &buf, self.block_size)
    }

    /// Release an inode slot and every block it reaches.
    fn free_inode(&self, slot: usize) -> Result<()> {
        let _guard = self.inode_lock(slot).write();
        let released = self.read_inode(slot).and_then(|inode| {
            let mut blocks = self.blocks_of(&inode)?;
            if inode.indirect_block != NO_BLOCK {
                blocks.push(inode.indirect_block);
            }
            self.free_blocks(&blocks)
        });
        if let Err(e) = &released {
            warn!(slot, error = %e, "leaking blocks of unreadable inode");
        }
        self.inodes.clear(slot);
        released
    }

    /// Data block pointers of `inode` in object order.
    fn blocks_of(&self, inode: &Inode) -> Result<Vec<i32>> {
        let count = inode.block_count(self.block_size);
        let mut blocks: Vec<i32> = inode.direct_blocks[..count.min(DIRECT_POINTERS)].to_vec();
        if count > DIRECT_POINTERS {
            let mut buf = vec![0u8; self.block_size];
            self.read_block(inode.indirect_block, &mut buf)?;
            blocks.extend(
                buf.chunks_exact(4)
                    .take(count - DIRECT_POINTERS)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        Ok(blocks)
    }

    fn allocate_block(&self) -> Result<i32> {
        let mut bits = self.data_blocks.lock();
        let block = bits.next_clear_bit(0)?.ok_or(Error::NoFreeBlocks)?;
        bits.set(block, true)?;
        Ok(block as i32)
    }

    fn free_blocks(&self, blocks: &[i32]) -> Result<()> {
        let mut bits = self.data_blocks.lock();
        for &b in blocks {
            let was_set = bits.set(b as usize, false)?;
            assert!(was_set, "data block {} freed twice", b);
        }
        Ok(())
    }

    fn block_offset(&self, block: i32) -> u64 {
        block as u64 * self.block_size as u64
    }

    fn read_block(&self, block: i32, buf: &mut [u8]) -> Result<()> {
        self.data_store.read_fully(self.block_offset(block), buf)
    }

    fn inode_lock(&self, slot: usize) -> &RwLock<()> {
        &self.inode_locks[slot % self.inode_locks.len()]
    }
}

/// Convert a store error for an `io::Write`/`io::Read` boundary.
fn to_io(e: &Error) -> io::Error {
    match e {
        Error::Io(inner) => io::Error::new(inner.kind(), inner.to_string()),
        other => io::Error::other(other.to_string()),
    }
}

/// `io::Write` adaptor filling data blocks as bytes arrive.
///
/// Blocks allocated by an uncommitted writer are freed on drop.
struct BlockWriter<'a> {
    cache: &'a FileStoreCache,
    buf: Vec<u8>,
    blocks: Vec<i32>,
    indirect: i32,
    length: usize,
    too_large: bool,
    failure: Option<Error>,
}

impl<'a> BlockWriter<'a> {
    fn new(cache: &'a FileStoreCache) -> Self {
        Self {
            cache,
            buf: Vec::with_capacity(cache.block_size),
            blocks: Vec::new(),
            indirect: NO_BLOCK,
            length: 0,
            too_large: false,
            failure: None,
        }
    }

    fn fail(&mut self, e: Error) -> io::Error {
        let io = to_io(&e);
        self.failure = Some(e);
        io
    }

    fn flush_block(&mut self) -> Result<()> {
        let block = self.cache.allocate_block()?;
        self.blocks.push(block);
        self.cache
            .data_store
            .write(self.cache.block_offset(block), &self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Write out the tail and the indirect block, returning the inode.
    fn finish(&mut self) -> Result<Inode> {
        if !self.buf.is_empty() {
            self.flush_block()?;
        }
        let mut inode = Inode::new(self.cache.generation.fetch_add(1, Ordering::Relaxed));
        inode.length = self.length as i64;
        for (slot, block) in inode.direct_blocks.iter_mut().zip(&self.blocks) {
            *slot = *block;
        }
        if self.blocks.len() > DIRECT_POINTERS {
            let mut pointers = vec![0u8; self.cache.block_size];
            for (i, chunk) in pointers.chunks_exact_mut(4).enumerate() {
                let b = self.blocks.get(DIRECT_POINTERS + i).copied().unwrap_or(NO_BLOCK);
                chunk.copy_from_slice(&b.to_le_bytes());
            }
            self.indirect = self.cache.allocate_block()?;
            self.cache
                .data_store
                .write(self.cache.block_offset(self.indirect), &pointers)?;
            inode.indirect_block = self.indirect;
        }
        Ok(inode)
    }

    /// Hand the blocks over to the stored inode.
    fn commit(&mut self) {
        self.blocks.clear();
        self.indirect = NO_BLOCK;
    }
}

impl Write for BlockWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.too_large || self.failure.is_some() {
            return Err(io::Error::other("object write already failed"));
        }
        if self.length + data.len() > self.cache.max_object_size {
            self.too_large = true;
            return Err(io::Error::other("object exceeds maximum stored size"));
        }
        let mut done = 0;
        while done < data.len() {
            let n = (self.cache.block_size - self.buf.len()).min(data.len() - done);
            self.buf.extend_from_slice(&data[done..done + n]);
            done += n;
            if self.buf.len() == self.cache.block_size {
                if let Err(e) = self.flush_block() {
                    return Err(self.fail(e));
                }
            }
        }
        self.length += data.len();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BlockWriter<'_> {
    fn drop(&mut self) {
        let mut blocks = std::mem::take(&mut self.blocks);
        if self.indirect != NO_BLOCK {
            blocks.push(self.indirect);
        }
        if blocks.is_empty() {
            return;
        }
        if let Err(e) = self.cache.free_blocks(&blocks) {
            warn!(count = blocks.len(), error = %e, "failed to release blocks of aborted write");
        }
    }
}

/// `io::Read` adaptor streaming an object out of its blocks.
struct BlockReader<'a> {
    cache: &'a FileStoreCache,
    blocks: Vec<i32>,
    length: u64,
    position: u64,
    failure: Option<Error>,
}

impl<'a> BlockReader<'a> {
    fn new(cache: &'a FileStoreCache, inode: &Inode) -> Result<Self> {
        Ok(Self {
            cache,
            blocks: cache.blocks_of(inode)?,
            length: inode.length as u64,
            position: 0,
            failure: None,
        })
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.cache.block_size as u64;
        let within = self.position % block_size;
        let n = (block_size - within)
            .min(self.length - self.position)
            .min(buf.len() as u64) as usize;
        let block = self.blocks[(self.position / block_size) as usize];
        let offset = self.cache.block_offset(block) + within;
        if let Err(e) = self.cache.data_store.read_fully(offset, &mut buf[..n]) {
            let io = to_io(&e);
            self.failure = Some(e);
            return Err(io);
        }
        self.position += n as u64;
        Ok(n)
    }
}
