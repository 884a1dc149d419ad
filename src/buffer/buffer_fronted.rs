//! Memory-fronted object cache.
//!
//! # Architecture
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  BufferFrontedFileStoreCache<T>                  │
//! │  ┌───────────────────────┐   ┌────────────────────────────────┐  │
//! │  │ resident: id → bytes  │   │ queues: soft (drained first),  │  │
//! │  │ in pooled mem blocks  │──▶│         hard (LRFU, shared     │  │
//! │  └───────────────────────┘   │         clock)                 │  │
//! │             │ evict          └────────────────────────────────┘  │
//! │             ▼                                                    │
//! │  ┌───────────────────────┐   ┌────────────────────────────────┐  │
//! │  │    FileStoreCache     │   │ loads: id → slot (single       │  │
//! │  │    (spilled bytes)    │   │        flight per id)          │  │
//! │  └───────────────────────┘   └────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lock Order
//! `spill stripe` → object store internals → `resident`. The `resident`
//! lock is never held across store I/O or (de)serialization.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, trace, warn};

use crate::buffer::replacer::LrfuEvictionQueue;
use crate::buffer::{CacheEntry, CacheStats, FileStoreCache, Serializer};
use crate::common::config::CacheConfig;
use crate::common::{Error, Result};

// ============================================================================
// Memory blocks
// ============================================================================

/// Recycles fixed-size memory blocks.
///
/// With direct memory the pool starts full; otherwise it fills as entries
/// are released. It never holds more than `retain` blocks.
struct MemoryPool {
    block_size: usize,
    retain: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl MemoryPool {
    fn new(block_size: usize, budget: usize, preallocate: bool) -> Self {
        let retain = budget / block_size;
        let free = if preallocate {
            (0..retain).map(|_| vec![0u8; block_size].into_boxed_slice()).collect()
        } else {
            Vec::new()
        };
        Self {
            block_size,
            retain,
            free: Mutex::new(free),
        }
    }

    fn take(&self) -> Box<[u8]> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.block_size].into_boxed_slice())
    }

    fn give_back(&self, blocks: Vec<Box<[u8]>>) {
        let mut free = self.free.lock();
        let room = self.retain.saturating_sub(free.len());
        free.extend(blocks.into_iter().take(room));
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// Serialized bytes of one resident entry.
struct SegmentBuffer {
    blocks: Vec<Box<[u8]>>,
    length: usize,
}

impl SegmentBuffer {
    /// Bytes of memory held, whole blocks included.
    fn memory_size(&self, block_size: usize) -> usize {
        self.blocks.len() * block_size
    }

    fn reader(&self) -> SegmentReader<'_> {
        SegmentReader {
            buffer: self,
            position: 0,
        }
    }
}

struct SegmentReader<'a> {
    buffer: &'a SegmentBuffer,
    position: usize,
}

impl Read for SegmentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.buffer.length || buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.buffer.blocks[0].len();
        let block = &self.buffer.blocks[self.position / block_size];
        let within = self.position % block_size;
        let n = (block_size - within)
            .min(self.buffer.length - self.position)
            .min(buf.len());
        buf[..n].copy_from_slice(&block[within..within + n]);
        self.position += n;
        Ok(n)
    }
}

/// `io::Write` into pooled blocks. Unfinished writers return their blocks.
struct MemoryWriter<'a> {
    pool: &'a MemoryPool,
    blocks: Vec<Box<[u8]>>,
    length: usize,
}

impl<'a> MemoryWriter<'a> {
    fn new(pool: &'a MemoryPool) -> Self {
        Self {
            pool,
            blocks: Vec::new(),
            length: 0,
        }
    }

    fn finish(mut self) -> SegmentBuffer {
        SegmentBuffer {
            blocks: std::mem::take(&mut self.blocks),
            length: self.length,
        }
    }
}

impl Write for MemoryWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let block_size = self.pool.block_size;
        let mut done = 0;
        while done < data.len() {
            let within = self.length % block_size;
            if within == 0 && self.length / block_size == self.blocks.len() {
                self.blocks.push(self.pool.take());
            }
            let n = (block_size - within).min(data.len() - done);
            let block = &mut self.blocks[self.length / block_size];
            block[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
            self.length += n;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        if !self.blocks.is_empty() {
            self.pool.give_back(std::mem::take(&mut self.blocks));
        }
    }
}

// ============================================================================
// Resident entries
// ============================================================================

struct Resident {
    buffer: Arc<SegmentBuffer>,
    serializer_id: i64,
    soft: bool,
    pin_count: usize,
    /// Being written to the object store; not in any queue.
    spilling: bool,
}

struct ResidentState {
    entries: HashMap<i64, Resident>,
    hard: LrfuEvictionQueue,
    soft: LrfuEvictionQueue,
    memory_in_use: usize,
}

impl ResidentState {
    fn queue(&mut self, soft: bool) -> &mut LrfuEvictionQueue {
        if soft {
            &mut self.soft
        } else {
            &mut self.hard
        }
    }

    fn touch(&mut self, id: i64, soft: bool) {
        self.queue(soft).record_access(id);
    }

    /// Take `id` out of memory bookkeeping.
    fn take(&mut self, id: i64, block_size: usize) -> Option<Resident> {
        let resident = self.entries.remove(&id)?;
        self.queue(resident.soft).remove(id);
        self.memory_in_use -= resident.buffer.memory_size(block_size);
        Some(resident)
    }
}

// ============================================================================
// Load slots
// ============================================================================

/// Per-id slot shared by everyone waiting to load that id.
struct LoadSlot<T> {
    /// Last value loaded, with the generation it was loaded under.
    loaded: Option<(u64, Arc<T>)>,
}

/// Table entry for one id with loads in flight.
///
/// `generation` lives outside the slot mutex so writers can invalidate a
/// loaded value while a holder keeps the slot locked.
struct LoadEntry<T> {
    slot: Arc<Mutex<LoadSlot<T>>>,
    generation: Arc<AtomicU64>,
}

type LoadTable<T> = Mutex<HashMap<i64, LoadEntry<T>>>;

/// Exclusive right to load one id, returned by
/// [`BufferFrontedFileStoreCache::lock_for_load`].
///
/// Concurrent holders of the same id queue up behind each other. Whatever
/// the first holder loads is handed to the later ones without deserializing
/// again. Dropping the guard unlocks; the slot disappears with its last
/// holder.
pub struct LoadGuard<'a, T> {
    id: i64,
    loads: &'a LoadTable<T>,
    generation: Arc<AtomicU64>,
    slot: Option<ArcMutexGuard<RawMutex, LoadSlot<T>>>,
}

impl<T> LoadGuard<'_, T> {
    /// The id this guard locks.
    pub fn id(&self) -> i64 {
        self.id
    }

    fn slot(&mut self) -> &mut LoadSlot<T> {
        match self.slot.as_mut() {
            Some(slot) => &mut **slot,
            None => unreachable!("load slot released before drop"),
        }
    }
}

impl<T> Drop for LoadGuard<'_, T> {
    fn drop(&mut self) {
        let mut loads = self.loads.lock();
        if let Some(guard) = self.slot.take() {
            let slot = Arc::clone(ArcMutexGuard::mutex(&guard));
            drop(guard);
            // Only the table and `slot` remain: nobody else is waiting.
            if Arc::strong_count(&slot) == 2 {
                loads.remove(&self.id);
            }
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Stripes serializing the spill, replacement and removal of one id.
const SPILL_STRIPES: usize = 64;

/// Keeps the hottest entries in memory and spills the rest to a
/// [`FileStoreCache`].
///
/// Entries are held as serialized bytes, so memory use is exact and an
/// eviction is a plain byte copy into the store.
pub struct BufferFrontedFileStoreCache<T> {
    store: FileStoreCache,
    pool: MemoryPool,
    memory_budget: usize,
    resident: Mutex<ResidentState>,
    loads: LoadTable<T>,
    spill_locks: Vec<Mutex<()>>,
    stats: CacheStats,
}

impl<T> BufferFrontedFileStoreCache<T> {
    /// Front `store` with a memory buffer sized by `config`.
    pub fn new(store: FileStoreCache, config: &CacheConfig) -> Self {
        let clock = Arc::new(AtomicI64::new(0));
        debug!(
            memory_budget = config.memory_buffer_space,
            direct = config.use_direct_memory,
            "created buffer fronted cache"
        );
        Self {
            pool: MemoryPool::new(
                store.block_size(),
                config.memory_buffer_space,
                config.use_direct_memory,
            ),
            store,
            memory_budget: config.memory_buffer_space,
            resident: Mutex::new(ResidentState {
                entries: HashMap::new(),
                hard: LrfuEvictionQueue::new(Arc::clone(&clock), config.crf_lambda),
                soft: LrfuEvictionQueue::new(clock, config.crf_lambda),
                memory_in_use: 0,
            }),
            loads: Mutex::new(HashMap::new()),
            spill_locks: (0..SPILL_STRIPES).map(|_| Mutex::new(())).collect(),
            stats: CacheStats::new(),
        }
    }

    // ========================================================================
    // Cache groups
    // ========================================================================

    /// Create `group` if it does not exist yet.
    pub fn create_cache_group(&self, group: i64) {
        self.store.create_cache_group(group);
    }

    /// Add `id` to `group`. Returns false if the group does not exist.
    pub fn add_to_cache_group(&self, group: i64, id: i64) -> bool {
        self.store.add_to_cache_group(group, id)
    }

    /// Remove `group`, dropping its members from memory and disk.
    ///
    /// Returns the number of entries removed. A load already reading a
    /// member finishes from the bytes it holds; every `get` issued after
    /// this returns misses.
    pub fn remove_cache_group(&self, group: i64) -> Result<usize> {
        let Some(ids) = self.store.take_cache_group(group) else {
            return Ok(0);
        };
        let block_size = self.pool.block_size;
        let mut removed = 0;
        let mut first_error = None;
        for id in ids {
            let _spill = self.spill_lock(id).lock();
            let resident = self.resident.lock().take(id, block_size);
            let stored = self.store.remove_object(id);
            self.invalidate_load(id);
            let found = resident.is_some();
            if let Some(resident) = resident {
                self.release(resident.buffer);
            }
            match stored {
                Ok(on_disk) if found || on_disk => removed += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(group, id, error = %e, "failed to remove spilled entry");
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!(group, removed, "removed cache group");
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Serialize `entry` into memory, evicting others first if the buffer
    /// is at or over budget.
    ///
    /// Replaces any previous value of the same id, in memory or on disk.
    pub fn add(&self, entry: &CacheEntry<T>, serializer: &dyn Serializer<T>) -> Result<()> {
        self.make_room()?;

        let mut writer = MemoryWriter::new(&self.pool);
        serializer.serialize(&entry.payload, &mut writer)?;
        let buffer = Arc::new(writer.finish());
        let size = buffer.memory_size(self.pool.block_size);
        let soft = serializer.use_soft_cache();

        let _spill = self.spill_lock(entry.id).lock();
        self.store.remove_object(entry.id)?;
        let replaced = {
            let mut state = self.resident.lock();
            let replaced = state.take(entry.id, self.pool.block_size);
            let queue = state.queue(soft);
            queue.record_access(entry.id);
            queue.set_evictable(entry.id, true);
            state.memory_in_use += size;
            state.entries.insert(
                entry.id,
                Resident {
                    buffer,
                    serializer_id: serializer.id(),
                    soft,
                    pin_count: 0,
                    spilling: false,
                },
            );
            replaced
        };
        self.invalidate_load(entry.id);
        if let Some(old) = replaced {
            self.release(old.buffer);
        }
        trace!(id = entry.id, size, soft, "added entry");
        Ok(())
    }

    /// Lock `id` for loading. Blocks while another holder has it.
    pub fn lock_for_load(&self, id: i64) -> LoadGuard<'_, T> {
        let (slot, generation) = {
            let mut loads = self.loads.lock();
            let entry = loads.entry(id).or_insert_with(|| LoadEntry {
                slot: Arc::new(Mutex::new(LoadSlot { loaded: None })),
                generation: Arc::new(AtomicU64::new(0)),
            });
            (Arc::clone(&entry.slot), Arc::clone(&entry.generation))
        };
        LoadGuard {
            id,
            loads: &self.loads,
            generation,
            slot: Some(slot.lock_arc()),
        }
    }

    /// Fetch the entry locked by `guard`.
    ///
    /// Checks, in order: a value already loaded under this load lock (unless
    /// the id was re-added or removed since), the memory buffer, the object
    /// store.
    pub fn get(
        &self,
        guard: &mut LoadGuard<'_, T>,
        serializer: &dyn Serializer<T>,
    ) -> Result<Option<CacheEntry<T>>> {
        let id = guard.id();
        let generation = guard.generation.load(Ordering::Acquire);
        match guard.slot().loaded.take() {
            Some((loaded_at, payload)) if loaded_at == generation => {
                guard.slot().loaded = Some((loaded_at, Arc::clone(&payload)));
                CacheStats::bump(&self.stats.shared_loads);
                return Ok(Some(CacheEntry::from_arc(id, payload)));
            }
            _ => {}
        }

        let payload = match self.read_resident(id, serializer)? {
            Some(payload) => {
                CacheStats::bump(&self.stats.memory_hits);
                Arc::new(payload)
            }
            None => match self.store.get(id, serializer)? {
                Some(entry) => {
                    CacheStats::bump(&self.stats.disk_reads);
                    entry.payload
                }
                None => {
                    CacheStats::bump(&self.stats.misses);
                    return Ok(None);
                }
            },
        };
        guard.slot().loaded = Some((generation, Arc::clone(&payload)));
        Ok(Some(CacheEntry::from_arc(id, payload)))
    }

    /// Lock, fetch and unlock `id` in one call.
    pub fn get_entry(&self, id: i64, serializer: &dyn Serializer<T>) -> Result<Option<CacheEntry<T>>> {
        let mut guard = self.lock_for_load(id);
        self.get(&mut guard, serializer)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Whether `id` is currently held in memory.
    pub fn is_resident(&self, id: i64) -> bool {
        self.resident.lock().entries.contains_key(&id)
    }

    /// Bytes of memory blocks held by resident entries.
    pub fn memory_in_use(&self) -> usize {
        self.resident.lock().memory_in_use
    }

    /// Memory budget in bytes.
    pub fn memory_budget(&self) -> usize {
        self.memory_budget
    }

    /// Data blocks in use by the object store.
    pub fn data_blocks_in_use(&self) -> usize {
        self.store.data_blocks_in_use()
    }

    /// Inodes in use by the object store.
    pub fn inodes_in_use(&self) -> usize {
        self.store.inodes_in_use()
    }

    /// Largest entry that can be spilled; bigger ones live in memory only.
    pub fn max_object_size(&self) -> usize {
        self.store.max_object_size()
    }

    /// The backing object store.
    pub fn store(&self) -> &FileStoreCache {
        &self.store
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Make values already loaded for `id` stale. Called after the id's
    /// contents change.
    fn invalidate_load(&self, id: i64) {
        if let Some(entry) = self.loads.lock().get(&id) {
            entry.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn spill_lock(&self, id: i64) -> &Mutex<()> {
        &self.spill_locks[(id as u64 % SPILL_STRIPES as u64) as usize]
    }

    /// Deserialize a resident entry, pinned for the duration.
    fn read_resident(&self, id: i64, serializer: &dyn Serializer<T>) -> Result<Option<T>> {
        let buffer = {
            let mut state = self.resident.lock();
            let Some(resident) = state.entries.get_mut(&id) else {
                return Ok(None);
            };
            if resident.serializer_id != serializer.id() {
                return Err(Error::Serialization(format!(
                    "entry {} was written by serializer {}, read with {}",
                    id,
                    resident.serializer_id,
                    serializer.id()
                )));
            }
            resident.pin_count += 1;
            let (soft, spilling) = (resident.soft, resident.spilling);
            let buffer = Arc::clone(&resident.buffer);
            if !spilling {
                state.queue(soft).set_evictable(id, false);
                state.touch(id, soft);
            }
            buffer
        };

        let result = serializer.deserialize(&mut buffer.reader());
        self.unpin(id, &buffer);
        result.map(Some)
    }

    fn unpin(&self, id: i64, buffer: &Arc<SegmentBuffer>) {
        let mut state = self.resident.lock();
        let Some(resident) = state.entries.get_mut(&id) else {
            return;
        };
        if !Arc::ptr_eq(&resident.buffer, buffer) {
            return;
        }
        resident.pin_count -= 1;
        let (soft, evictable) = (resident.soft, resident.pin_count == 0 && !resident.spilling);
        if evictable {
            state.queue(soft).set_evictable(id, true);
        }
    }

    /// Evict lowest-ranked entries while memory use is at or over budget.
    ///
    /// Gives up quietly when everything left is pinned.
    fn make_room(&self) -> Result<()> {
        loop {
            let (id, buffer) = {
                let mut state = self.resident.lock();
                if state.memory_in_use < self.memory_budget {
                    return Ok(());
                }
                let victim = match state.soft.evict() {
                    Some(id) => Some(id),
                    None => state.hard.evict(),
                };
                let Some(id) = victim else {
                    trace!(in_use = state.memory_in_use, "all resident entries pinned");
                    return Ok(());
                };
                let Some(resident) = state.entries.get_mut(&id) else {
                    continue;
                };
                resident.spilling = true;
                (id, Arc::clone(&resident.buffer))
            };
            CacheStats::bump(&self.stats.evictions);
            self.spill(id, buffer)?;
        }
    }

    /// Write an evicted entry to the store and drop it from memory.
    fn spill(&self, id: i64, buffer: Arc<SegmentBuffer>) -> Result<()> {
        let _spill = self.spill_lock(id).lock();
        let stored = self
            .store
            .add_stream(id, buffer.length, &mut buffer.reader());

        let mut state = self.resident.lock();
        let current = state
            .entries
            .get(&id)
            .is_some_and(|r| Arc::ptr_eq(&r.buffer, &buffer));
        match stored {
            Err(e) => {
                if current {
                    // Put it back so a later eviction can retry.
                    let soft = state.entries.get(&id).is_some_and(|r| r.soft);
                    if let Some(resident) = state.entries.get_mut(&id) {
                        resident.spilling = false;
                    }
                    state.touch(id, soft);
                    let pinned = state.entries.get(&id).is_some_and(|r| r.pin_count > 0);
                    state.queue(soft).set_evictable(id, !pinned);
                }
                warn!(id, error = %e, "failed to spill entry");
                Err(e)
            }
            Ok(written) => {
                if current {
                    state.take(id, self.pool.block_size);
                }
                drop(state);
                if written {
                    CacheStats::bump(&self.stats.spills);
                    trace!(id, length = buffer.length, "spilled entry");
                    if !current {
                        self.store.remove_object(id)?;
                    }
                } else {
                    CacheStats::bump(&self.stats.dropped);
                    warn!(
                        id,
                        length = buffer.length,
                        max = self.store.max_object_size(),
                        "dropping entry too large to spill"
                    );
                }
                self.release(buffer);
                Ok(())
            }
        }
    }

    /// Return an entry's blocks to the pool once no reader holds them.
    fn release(&self, buffer: Arc<SegmentBuffer>) {
        if let Ok(buffer) = Arc::try_unwrap(buffer) {
            self.pool.give_back(buffer.blocks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BytesSerializer;
    use crate::storage::MemoryStorageManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn config(memory: usize) -> CacheConfig {
        CacheConfig {
            block_size: 512,
            memory_buffer_space: memory,
            max_storage_object_size: 64 * 1024,
            max_buffer_space: 1 << 24,
            concurrency_level: 4,
            ..CacheConfig::default()
        }
    }

    fn create(memory: usize) -> BufferFrontedFileStoreCache<Vec<u8>> {
        let config = config(memory);
        let store = FileStoreCache::new(Arc::new(MemoryStorageManager::new()), &config).unwrap();
        BufferFrontedFileStoreCache::new(store, &config)
    }

    fn entry(id: i64, len: usize) -> CacheEntry<Vec<u8>> {
        CacheEntry::new(id, (0..len).map(|i| (i as u8) ^ (id as u8)).collect())
    }

    #[test]
    fn test_memory_round_trip() {
        let cache = create(1 << 20);
        let s = BytesSerializer::new(1);
        cache.create_cache_group(1);
        cache.add_to_cache_group(1, 5);
        cache.add(&entry(5, 1000), &s).unwrap();

        assert!(cache.is_resident(5));
        assert_eq!(cache.memory_in_use(), 1024);
        let back = cache.get_entry(5, &s).unwrap().unwrap();
        assert_eq!(*back.payload, *entry(5, 1000).payload);
        assert_eq!(cache.stats().snapshot().memory_hits, 1);
        assert_eq!(cache.data_blocks_in_use(), 0);
    }

    #[test]
    fn test_eviction_spills_lowest_ranked() {
        let cache = create(4096);
        let s = BytesSerializer::new(1);
        cache.create_cache_group(1);
        for id in 0..3 {
            cache.add_to_cache_group(1, id);
            cache.add(&entry(id, 3000), &s).unwrap();
        }
        // 3000 bytes = 6 blocks = 3072 bytes of memory each.
        assert!(!cache.is_resident(0));
        assert!(cache.is_resident(1));
        assert!(cache.is_resident(2));
        assert_eq!(cache.stats().snapshot().spills, 1);

        let back = cache.get_entry(0, &s).unwrap().unwrap();
        assert_eq!(*back.payload, *entry(0, 3000).payload);
        assert_eq!(cache.stats().snapshot().disk_reads, 1);
    }

    #[test]
    fn test_recently_read_entry_survives() {
        let cache = create(4096);
        let s = BytesSerializer::new(1);
        cache.add(&entry(0, 2000), &s).unwrap();
        cache.add(&entry(1, 2000), &s).unwrap();
        for _ in 0..3 {
            cache.get_entry(0, &s).unwrap();
        }
        cache.add(&entry(2, 2000), &s).unwrap();
        assert!(cache.is_resident(0));
        assert!(!cache.is_resident(1));
    }

    #[test]
    fn test_soft_entries_evicted_first() {
        let cache = create(2048);
        let hard = BytesSerializer::new(1);
        let soft = BytesSerializer::soft(1);
        cache.add(&entry(0, 1024), &hard).unwrap();
        cache.add(&entry(1, 1024), &soft).unwrap();
        for _ in 0..3 {
            cache.get_entry(1, &soft).unwrap();
        }
        cache.add(&entry(2, 100), &hard).unwrap();
        assert!(cache.is_resident(0));
        assert!(!cache.is_resident(1));
    }

    #[test]
    fn test_oversized_entry_dropped_on_eviction() {
        let cache = create(1024);
        let s = BytesSerializer::new(1);
        let big = cache.max_object_size() + 1;
        cache.add(&entry(0, big), &s).unwrap();
        assert!(cache.is_resident(0));

        cache.add(&entry(1, 10), &s).unwrap();
        assert!(!cache.is_resident(0));
        assert_eq!(cache.stats().snapshot().dropped, 1);
        assert!(cache.get_entry(0, &s).unwrap().is_none());
        assert_eq!(cache.data_blocks_in_use(), 0);
    }

    #[test]
    fn test_pinned_entries_not_evicted() {
        let cache = create(1024);
        let s = BytesSerializer::new(1);
        cache.add(&entry(0, 1024), &s).unwrap();
        {
            let mut state = cache.resident.lock();
            state.entries.get_mut(&0).unwrap().pin_count = 1;
            state.hard.set_evictable(0, false);
        }
        cache.add(&entry(1, 1024), &s).unwrap();
        assert!(cache.is_resident(0));
        assert!(cache.is_resident(1));
        assert_eq!(cache.memory_in_use(), 2048);
    }

    #[test]
    fn test_readd_replaces_spilled_copy() {
        let cache = create(1024);
        let s = BytesSerializer::new(1);
        cache.add(&entry(0, 1024), &s).unwrap();
        cache.add(&entry(1, 1024), &s).unwrap();
        assert!(!cache.is_resident(0));
        assert!(cache.data_blocks_in_use() > 0);

        cache.add(&CacheEntry::new(0, vec![9u8; 10]), &s).unwrap();
        assert_eq!(cache.inodes_in_use(), 1);
        let back = cache.get_entry(0, &s).unwrap().unwrap();
        assert_eq!(*back.payload, vec![9u8; 10]);
    }

    #[test]
    fn test_remove_group_clears_memory_and_disk() {
        let cache = create(2048);
        let s = BytesSerializer::new(1);
        cache.create_cache_group(7);
        for id in 0..6 {
            assert!(cache.add_to_cache_group(7, id));
            cache.add(&entry(id, 900), &s).unwrap();
        }
        assert!(cache.inodes_in_use() > 0);
        assert_eq!(cache.remove_cache_group(7).unwrap(), 6);
        assert_eq!(cache.memory_in_use(), 0);
        assert_eq!(cache.data_blocks_in_use(), 0);
        assert_eq!(cache.inodes_in_use(), 0);
        assert!(cache.get_entry(3, &s).unwrap().is_none());
    }

    #[test]
    fn test_direct_memory_prefills_pool() {
        let config = CacheConfig {
            use_direct_memory: true,
            ..config(4096)
        };
        let store = FileStoreCache::new(Arc::new(MemoryStorageManager::new()), &config).unwrap();
        let cache: BufferFrontedFileStoreCache<Vec<u8>> = BufferFrontedFileStoreCache::new(store, &config);
        assert_eq!(cache.pool.pooled(), 8);
        cache.add(&entry(0, 1000), &BytesSerializer::new(1)).unwrap();
        assert_eq!(cache.pool.pooled(), 6);
    }

    #[test]
    fn test_serializer_mismatch() {
        let cache = create(4096);
        cache.add(&entry(0, 10), &BytesSerializer::new(1)).unwrap();
        let err = cache.get_entry(0, &BytesSerializer::new(2)).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        // The failed read must not leave the entry pinned.
        cache.add(&entry(1, 4096), &BytesSerializer::new(1)).unwrap();
        cache.add(&entry(2, 10), &BytesSerializer::new(1)).unwrap();
        assert!(!cache.is_resident(0));
    }

    #[test]
    fn test_readd_invalidates_loaded_value() {
        let cache = create(1 << 20);
        let s = BytesSerializer::new(1);
        cache.add(&CacheEntry::new(0, vec![1u8; 10]), &s).unwrap();

        let mut guard = cache.lock_for_load(0);
        let first = cache.get(&mut guard, &s).unwrap().unwrap();
        assert_eq!(*first.payload, vec![1u8; 10]);

        cache.add(&CacheEntry::new(0, vec![2u8; 10]), &s).unwrap();
        let again = cache.get(&mut guard, &s).unwrap().unwrap();
        assert_eq!(*again.payload, vec![2u8; 10]);

        // A waiter queued behind the guard sees the new value too.
        cache.add(&CacheEntry::new(0, vec![3u8; 10]), &s).unwrap();
        let waited = thread::scope(|scope| {
            let waiter = scope.spawn(|| cache.get_entry(0, &s).unwrap().unwrap());
            thread::sleep(Duration::from_millis(20));
            drop(guard);
            waiter.join().unwrap()
        });
        assert_eq!(*waited.payload, vec![3u8; 10]);
        assert_eq!(cache.stats().snapshot().shared_loads, 0);
    }

    #[test]
    fn test_group_removal_invalidates_loaded_value() {
        let cache = create(1 << 20);
        let s = BytesSerializer::new(1);
        cache.create_cache_group(7);
        cache.add_to_cache_group(7, 0);
        cache.add(&entry(0, 100), &s).unwrap();

        let mut guard = cache.lock_for_load(0);
        assert!(cache.get(&mut guard, &s).unwrap().is_some());
        assert_eq!(cache.remove_cache_group(7).unwrap(), 1);
        assert!(cache.get(&mut guard, &s).unwrap().is_none());

        let waited = thread::scope(|scope| {
            let waiter = scope.spawn(|| cache.get_entry(0, &s).unwrap());
            thread::sleep(Duration::from_millis(20));
            drop(guard);
            waiter.join().unwrap()
        });
        assert!(waited.is_none());
        assert!(cache.loads.lock().is_empty());
    }

    /// Counts deserializations and sleeps to widen the race window.
    struct SlowSerializer {
        loads: Arc<AtomicUsize>,
    }

    impl Serializer<Vec<u8>> for SlowSerializer {
        fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<()> {
            out.write_all(value)?;
            Ok(())
        }

        fn deserialize(&self, input: &mut dyn Read) -> Result<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            let mut value = Vec::new();
            input.read_to_end(&mut value)?;
            Ok(value)
        }

        fn id(&self) -> i64 {
            1
        }
    }

    #[test]
    fn test_single_flight_load() {
        let cache = Arc::new(create(1024));
        let loads = Arc::new(AtomicUsize::new(0));
        let s = Arc::new(SlowSerializer {
            loads: Arc::clone(&loads),
        });
        cache.add(&entry(0, 1024), s.as_ref()).unwrap();
        cache.add(&entry(1, 1024), s.as_ref()).unwrap();
        assert!(!cache.is_resident(0));

        // Hold the load lock so every thread queues on the same slot.
        let mut first = cache.lock_for_load(0);
        let barrier = Arc::new(Barrier::new(9));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let s = Arc::clone(&s);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_entry(0, s.as_ref()).unwrap().unwrap()
                })
            })
            .collect();
        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        let loaded = cache.get(&mut first, s.as_ref()).unwrap().unwrap();
        drop(first);

        for h in handles {
            let got = h.join().unwrap();
            assert!(Arc::ptr_eq(&got.payload, &loaded.payload));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().snapshot().shared_loads, 8);
        assert!(cache.loads.lock().is_empty());
    }
}
