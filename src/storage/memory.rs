//! In-memory storage manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::Result;
use crate::storage::{check_read, FileStore, StorageManager};

/// Backs every store with a growable in-memory buffer.
///
/// Used in tests and when no storage directory is configured.
#[derive(Debug, Default)]
pub struct MemoryStorageManager {
    used: Arc<AtomicU64>,
}

impl MemoryStorageManager {
    /// Create a new manager with no stores.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageManager for MemoryStorageManager {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn create_file_store(&self, _name: &str) -> Result<Arc<dyn FileStore>> {
        Ok(Arc::new(MemoryFileStore {
            data: RwLock::new(Vec::new()),
            used: Arc::clone(&self.used),
        }))
    }

    fn used_space(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn max_space(&self) -> u64 {
        u64::MAX
    }
}

struct MemoryFileStore {
    data: RwLock<Vec<u8>>,
    used: Arc<AtomicU64>,
}

impl MemoryFileStore {
    fn resize(&self, data: &mut Vec<u8>, length: usize) {
        let before = data.len() as u64;
        data.resize(length, 0);
        let after = length as u64;
        if after > before {
            self.used.fetch_add(after - before, Ordering::Relaxed);
        } else {
            self.used.fetch_sub(before - after, Ordering::Relaxed);
        }
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let n = check_read(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            self.resize(&mut data, end);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_length(&self, length: u64) -> Result<()> {
        let mut data = self.data.write();
        self.resize(&mut data, length as usize);
        Ok(())
    }

    fn length(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn remove(&self) -> Result<()> {
        let mut data = self.data.write();
        self.resize(&mut data, 0);
        data.shrink_to_fit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::storage::tests::check_store_against_model;
    use proptest::prelude::*;

    #[test]
    fn test_write_read() {
        let sm = MemoryStorageManager::new();
        let store = sm.create_file_store("t").unwrap();
        store.write(0, b"hello").unwrap();

        let mut buf = [0u8; 5];
        store.read_fully(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(sm.used_space(), 5);
    }

    #[test]
    fn test_gap_is_zero_filled() {
        let sm = MemoryStorageManager::new();
        let store = sm.create_file_store("t").unwrap();
        store.write(10, b"x").unwrap();
        assert_eq!(store.length(), 11);

        let mut buf = [0xFFu8; 11];
        store.read_fully(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(buf[10], b'x');
    }

    #[test]
    fn test_short_read_and_read_past_end() {
        let sm = MemoryStorageManager::new();
        let store = sm.create_file_store("t").unwrap();
        store.write(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(store.read(1, &mut buf).unwrap(), 2);
        assert!(matches!(
            store.read(4, &mut buf),
            Err(Error::ReadPastEnd { .. })
        ));
        assert!(matches!(
            store.read_fully(0, &mut buf),
            Err(Error::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn test_remove_releases_space() {
        let sm = MemoryStorageManager::new();
        let store = sm.create_file_store("t").unwrap();
        store.write(0, &[1u8; 100]).unwrap();
        store.remove().unwrap();
        assert_eq!(sm.used_space(), 0);
        assert_eq!(store.length(), 0);
    }

    #[test]
    fn test_matches_model() {
        let sm = MemoryStorageManager::new();
        let store = sm.create_file_store("t").unwrap();
        check_store_against_model(
            store.as_ref(),
            &[
                (0, vec![1, 2, 3], 1),
                (50, vec![9; 20], 0),
                (5, vec![7; 3], 3),
                (2, vec![4; 40], 8),
            ],
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
        #[test]
        fn prop_matches_model(
            ops in prop::collection::vec(
                (0u16..300, prop::collection::vec(any::<u8>(), 0..100), any::<u16>()),
                1..16,
            ),
        ) {
            let sm = MemoryStorageManager::new();
            let store = sm.create_file_store("p").unwrap();
            check_store_against_model(store.as_ref(), &ops);
        }
    }
}
