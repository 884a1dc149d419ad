//! Buffer management.
//!
//! The buffer layer sits between query processing and the storage layer.
//! It keeps serialized batches in memory and spills them to block storage
//! when memory runs short.
//!
//! # Components
//! - [`BufferManager`] - Top-level facade with memory reservation
//! - [`BufferFrontedFileStoreCache`] - Memory buffer over the object store
//! - [`FileStoreCache`] - Inode-based object store on block storage
//! - [`Serializer`] / [`CacheEntry`] - Caller-supplied payload encoding
//! - [`CacheStats`] - Performance statistics
//! - [`replacer`] - LRFU eviction ranking

mod buffer_fronted;
mod buffer_manager;
mod file_store_cache;
mod inode;
pub mod replacer;
mod serializer;
mod stats;

pub use buffer_fronted::{BufferFrontedFileStoreCache, LoadGuard};
pub use buffer_manager::{BufferManager, BufferReserveMode, ReserveStats};
pub use file_store_cache::FileStoreCache;
pub use inode::{Inode, NO_BLOCK};
pub use serializer::{BytesSerializer, CacheEntry, Serializer};
pub use stats::{CacheStats, StatsSnapshot};
