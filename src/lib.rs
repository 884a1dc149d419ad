//! spillcache - an out-of-core buffer cache for intermediate query results.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          BufferManager                          │
//! │            cache groups · memory reserve · config               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │          BufferFrontedFileStoreCache (buffer/)          │    │
//! │  │   memory blocks · LRFU hard/soft tiers · single flight  │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                              ↓ spill                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │               FileStoreCache (buffer/)                  │    │
//! │  │   inodes · data-block bitmap · id → inode hash index    │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                              ↓                                  │
//! │  ┌───────────────────────────┐  ┌──────────────────────────┐    │
//! │  │ bitset/  index/           │  │ storage/                 │    │
//! │  │ bitmaps, hash table       │  │ memory · file · split ·  │    │
//! │  │ in blocks                 │  │ encrypted                │    │
//! │  └───────────────────────────┘  └──────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//! - [`common`] - Configuration and errors
//! - [`buffer`] - The caches, eviction policy and the buffer manager
//! - [`storage`] - Byte stores and block allocation
//! - [`bitset`] - Bitmaps and bit allocators
//! - [`index`] - Block-resident hash index
//!
//! # Quick Start
//! ```
//! use spillcache::buffer::{BufferManager, BytesSerializer, CacheEntry};
//! use spillcache::CacheConfig;
//!
//! let manager: BufferManager<Vec<u8>> = BufferManager::new(CacheConfig::default()).unwrap();
//! let serializer = BytesSerializer::new(1);
//!
//! manager.create_cache_group(7);
//! manager.add_to_cache_group(7, 1);
//! manager.add(&CacheEntry::new(1, vec![0u8; 100]), &serializer).unwrap();
//! assert!(manager.get(1, &serializer).unwrap().is_some());
//!
//! manager.remove_cache_group(7).unwrap();
//! assert!(manager.get(1, &serializer).unwrap().is_none());
//! ```

pub mod bitset;
pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used items at crate root for convenience
pub use common::config::CacheConfig;
pub use common::{Error, Result};

pub use buffer::{
    BufferFrontedFileStoreCache, BufferManager, BufferReserveMode, CacheEntry, CacheStats,
    FileStoreCache, Serializer, StatsSnapshot,
};
pub use storage::{FileStore, StorageManager};
