//! Error types for spillcache.

use thiserror::Error;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
/// This is a common Rust pattern (see `std::io::Result`).
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in spillcache.
///
/// Oversized objects and short memory grants are *not* errors: the cache
/// reports them as misses and partial grants. Everything here propagates to
/// the caller untouched; no layer retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a storage manager.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write would grow the on-disk buffer space past its configured limit.
    #[error("buffer space exhausted: {requested} bytes requested, limit is {limit} bytes")]
    OutOfDiskSpace { requested: u64, limit: u64 },

    /// A read reached past the current length of a store.
    ///
    /// This indicates a bug in the caller - stores are only read where they
    /// were previously written.
    #[error("read past end of store: offset {offset} + {len} exceeds length {length}")]
    ReadPastEnd { offset: u64, len: u64, length: u64 },

    /// Every data block is allocated.
    #[error("no free blocks available")]
    NoFreeBlocks,

    /// Every inode slot is allocated.
    #[error("no free inodes available")]
    NoFreeInodes,

    /// An inode record failed validation.
    #[error("corrupt inode {inode}: {reason}")]
    CorruptInode { inode: usize, reason: String },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied serializer failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The store was removed and can no longer be used.
    #[error("store {0} has been removed")]
    StoreRemoved(String),
}

impl Error {
    /// Whether this error came from the storage layer (disk, file handles, space).
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::OutOfDiskSpace { .. })
    }
}
