//! Buffer Manager - the entry point used by query processing.
//!
//! The [`BufferManager`] provides:
//! - A memory-fronted, disk-spilling cache of serialized batches
//! - Cache groups for bulk teardown
//! - A reserve pool that operators draw working memory from

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::buffer::{
    BufferFrontedFileStoreCache, CacheEntry, CacheStats, FileStoreCache, LoadGuard, Serializer,
};
use crate::common::config::CacheConfig;
use crate::common::Result;
use crate::storage::{
    EncryptedStorageManager, FileStorageManager, MemoryStorageManager, SplittableStorageManager,
    StorageManager,
};

/// How [`BufferManager::reserve_buffers`] behaves when the reserve is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferReserveMode {
    /// Grant the full amount, letting the reserve go negative.
    Force,
    /// Grant whatever is available right now, possibly nothing.
    NoWait,
}

/// What a blocking reservation had to wait for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReserveStats {
    /// Times the caller went to sleep waiting for releases.
    pub waits: u64,

    /// Total time spent asleep.
    pub wait_time: Duration,

    /// Reservations granted past the available amount.
    pub forced: u64,
}

/// Owns the storage stack, the spill cache and the memory reserve.
///
/// # Architecture
/// ```text
/// ┌─────────────────────────────────────────────────────────────┐
/// │                      BufferManager<T>                       │
/// │  ┌───────────────────────────┐   ┌──────────────────────┐   │
/// │  │ BufferFrontedFileStore-   │   │ reserve: available   │   │
/// │  │ Cache<T>                  │   │ bytes + Condvar      │   │
/// │  └─────────────┬─────────────┘   └──────────────────────┘   │
/// │                ▼                                            │
/// │  ┌───────────────────────────────────────────────────────┐  │
/// │  │ StorageManager: Memory | File [→ Splittable]          │  │
/// │  │                                [→ Encrypted]          │  │
/// │  └───────────────────────────────────────────────────────┘  │
/// └─────────────────────────────────────────────────────────────┘
/// ```
///
/// # Usage
/// ```
/// use spillcache::buffer::{BufferManager, BufferReserveMode, BytesSerializer, CacheEntry};
/// use spillcache::CacheConfig;
///
/// let manager: BufferManager<Vec<u8>> = BufferManager::new(CacheConfig::default()).unwrap();
/// let serializer = BytesSerializer::new(1);
///
/// manager.create_cache_group(1);
/// manager.add_to_cache_group(1, 42);
/// manager.add(&CacheEntry::new(42, vec![1, 2, 3]), &serializer).unwrap();
/// let entry = manager.get(42, &serializer).unwrap().unwrap();
/// assert_eq!(*entry.payload, vec![1, 2, 3]);
///
/// let granted = manager.reserve_buffers(1024, BufferReserveMode::NoWait);
/// manager.release_buffers(granted);
/// ```
pub struct BufferManager<T> {
    config: CacheConfig,
    storage: Arc<dyn StorageManager>,
    cache: BufferFrontedFileStoreCache<T>,

    /// Bytes left in the reserve. Negative after forced grants.
    reserve: Mutex<i64>,
    reserve_released: Condvar,
}

impl<T> BufferManager<T> {
    /// Build the storage stack `config` describes and a cache over it.
    ///
    /// # Errors
    /// - `Error::InvalidConfig` if `config` does not validate
    /// - `Error::Io` if the spill directory cannot be prepared
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let storage = storage_for(&config);
        Self::with_storage(config, storage)
    }

    /// Build a cache over a caller-supplied storage manager.
    pub fn with_storage(config: CacheConfig, storage: Arc<dyn StorageManager>) -> Result<Self> {
        config.validate()?;
        storage.initialize()?;
        let store = FileStoreCache::new(Arc::clone(&storage), &config)?;
        let cache = BufferFrontedFileStoreCache::new(store, &config);
        info!(
            memory_buffer_space = config.memory_buffer_space,
            max_buffer_space = config.max_buffer_space,
            max_reserve_bytes = config.max_reserve_bytes,
            "buffer manager started"
        );
        Ok(Self {
            reserve: Mutex::new(clamp_i64(config.max_reserve_bytes)),
            reserve_released: Condvar::new(),
            config,
            storage,
            cache,
        })
    }

    // ========================================================================
    // Cache
    // ========================================================================

    pub fn create_cache_group(&self, group: i64) {
        self.cache.create_cache_group(group);
    }

    pub fn add_to_cache_group(&self, group: i64, id: i64) -> bool {
        self.cache.add_to_cache_group(group, id)
    }

    /// Drop every member of `group` from memory and disk.
    pub fn remove_cache_group(&self, group: i64) -> Result<usize> {
        self.cache.remove_cache_group(group)
    }

    pub fn add(&self, entry: &CacheEntry<T>, serializer: &dyn Serializer<T>) -> Result<()> {
        self.cache.add(entry, serializer)
    }

    /// Fetch `id` under its load lock.
    pub fn get(&self, id: i64, serializer: &dyn Serializer<T>) -> Result<Option<CacheEntry<T>>> {
        self.cache.get_entry(id, serializer)
    }

    /// Lock `id` for a load spanning several calls. See [`LoadGuard`].
    pub fn lock_for_load(&self, id: i64) -> LoadGuard<'_, T> {
        self.cache.lock_for_load(id)
    }

    pub fn get_locked(
        &self,
        guard: &mut LoadGuard<'_, T>,
        serializer: &dyn Serializer<T>,
    ) -> Result<Option<CacheEntry<T>>> {
        self.cache.get(guard, serializer)
    }

    pub fn cache(&self) -> &BufferFrontedFileStoreCache<T> {
        &self.cache
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn data_blocks_in_use(&self) -> usize {
        self.cache.data_blocks_in_use()
    }

    pub fn inodes_in_use(&self) -> usize {
        self.cache.inodes_in_use()
    }

    pub fn memory_in_use(&self) -> usize {
        self.cache.memory_in_use()
    }

    pub fn stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    /// Bytes currently held by the storage stack.
    pub fn used_storage_space(&self) -> u64 {
        self.storage.used_space()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // Reservation
    // ========================================================================

    /// Take up to `amount` bytes from the reserve without blocking.
    ///
    /// Returns the number of bytes granted.
    pub fn reserve_buffers(&self, amount: usize, mode: BufferReserveMode) -> usize {
        let mut available = self.reserve.lock();
        let granted = match mode {
            BufferReserveMode::Force => amount,
            BufferReserveMode::NoWait => amount.min((*available).max(0) as usize),
        };
        *available -= clamp_i64(granted);
        debug!(amount, granted, ?mode, available = *available, "reserved buffers");
        granted
    }

    /// Take `amount` bytes from the reserve, sleeping until they are
    /// released by others.
    ///
    /// Requests above [`max_reserve_bytes`](Self::max_reserve_bytes) are
    /// clamped to it. With `force` the grant is immediate.
    pub fn reserve_buffers_blocking(&self, amount: usize, stats: &mut ReserveStats, force: bool) -> usize {
        let amount = amount.min(self.config.max_reserve_bytes);
        let wanted = clamp_i64(amount);
        let mut available = self.reserve.lock();
        if force {
            if *available < wanted {
                stats.forced += 1;
            }
        } else {
            while *available < wanted {
                stats.waits += 1;
                let start = Instant::now();
                self.reserve_released.wait(&mut available);
                stats.wait_time += start.elapsed();
            }
        }
        *available -= wanted;
        debug!(amount, force, available = *available, "reserved buffers");
        amount
    }

    /// Give `amount` bytes back to the reserve and wake waiters.
    pub fn release_buffers(&self, amount: usize) {
        let mut available = self.reserve.lock();
        *available += clamp_i64(amount);
        debug!(amount, available = *available, "released buffers");
        drop(available);
        self.reserve_released.notify_all();
    }

    /// Bytes left in the reserve. Negative after forced grants.
    pub fn reserve_available(&self) -> i64 {
        *self.reserve.lock()
    }

    pub fn max_reserve_bytes(&self) -> usize {
        self.config.max_reserve_bytes
    }

    /// Working-set limit of a single processing operation.
    pub fn max_processing_bytes(&self) -> usize {
        self.config.max_processing_bytes
    }
}

/// The storage stack `config` asks for.
fn storage_for(config: &CacheConfig) -> Arc<dyn StorageManager> {
    let Some(directory) = &config.storage_directory else {
        debug!("no storage directory, spilling to memory");
        return Arc::new(MemoryStorageManager::new());
    };
    let mut storage: Arc<dyn StorageManager> = Arc::new(FileStorageManager::new(
        directory,
        config.max_buffer_space,
        config.max_open_files,
    ));
    if let Some(max_file_size) = config.max_file_size {
        storage = Arc::new(SplittableStorageManager::new(storage, max_file_size));
    }
    if config.encrypt_files {
        storage = Arc::new(EncryptedStorageManager::new(storage));
    }
    debug!(
        directory = %directory.display(),
        split = config.max_file_size.is_some(),
        encrypted = config.encrypt_files,
        "spilling to files"
    );
    storage
}

fn clamp_i64(amount: usize) -> i64 {
    amount.min(i64::MAX as usize) as i64
}
