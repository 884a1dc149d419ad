//! Storage layer - byte-addressable stores and block allocation.
//!
//! This module handles where spilled bytes live:
//! - [`FileStore`] / [`StorageManager`] - the pluggable store contract
//! - [`MemoryStorageManager`] - in-memory stores (tests, no-disk setups)
//! - [`FileStorageManager`] - files under a directory, space and handle limits
//! - [`SplittableStorageManager`] - splits large stores across several files
//! - [`EncryptedStorageManager`] - encrypts another manager's stores
//! - [`BlockManager`] - fixed-size blocks carved out of a store

mod block_manager;
mod encrypted;
mod file;
mod memory;
mod splittable;

use std::sync::Arc;

use crate::common::{Error, Result};

pub use block_manager::{BlockManager, StoreBlockManager};
pub use encrypted::EncryptedStorageManager;
pub use file::FileStorageManager;
pub use memory::MemoryStorageManager;
pub use splittable::SplittableStorageManager;

/// A growable, byte-addressable store.
///
/// All methods take `&self`; implementations synchronize internally so a
/// store can be shared between threads.
pub trait FileStore: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning how many were read.
    ///
    /// Returns fewer bytes only when the store ends first.
    ///
    /// # Errors
    /// `Error::ReadPastEnd` if `offset` is beyond the current length.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    /// `Error::ReadPastEnd` if the store is shorter than `offset + buf.len()`.
    fn read_fully(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let length = self.length();
        let end = offset + buf.len() as u64;
        if end > length {
            return Err(Error::ReadPastEnd {
                offset,
                len: buf.len() as u64,
                length,
            });
        }
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::ReadPastEnd {
                    offset,
                    len: buf.len() as u64,
                    length: self.length(),
                });
            }
            done += n;
        }
        Ok(())
    }

    /// Write `buf` at `offset`, zero-filling any gap past the current length.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Truncate or extend (with zeros) to exactly `length` bytes.
    fn set_length(&self, length: u64) -> Result<()>;

    /// Current length in bytes.
    fn length(&self) -> u64;

    /// Release the store's space. The store must not be used afterwards.
    fn remove(&self) -> Result<()>;
}

/// Creates [`FileStore`]s and accounts for the space they use.
pub trait StorageManager: Send + Sync {
    /// Prepare backing resources (directories, handles).
    fn initialize(&self) -> Result<()>;

    /// Create a new, empty store. `name` is a hint used in file names and logs.
    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>>;

    /// Bytes currently held by this manager's stores.
    fn used_space(&self) -> u64;

    /// Space limit, `u64::MAX` when unbounded.
    fn max_space(&self) -> u64;
}

/// Check a read request against the current length.
pub(crate) fn check_read(offset: u64, len: usize, length: u64) -> Result<usize> {
    if offset > length {
        return Err(Error::ReadPastEnd {
            offset,
            len: len as u64,
            length,
        });
    }
    Ok(len.min((length - offset) as usize))
}
