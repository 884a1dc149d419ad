//! Storage manager that encrypts another manager's stores.
//!
//! Every store is encrypted in 16-byte cipher blocks with AES-128 in an XEX
//! construction: block `n` is encrypted as `E(k1, p ^ t) ^ t` where
//! `t = E(k2, n)`. Equal plaintext blocks at different positions therefore
//! encrypt differently, and any block can be rewritten on its own.
//!
//! Keys are random and live only as long as the manager; spill data is
//! unreadable once the process exits.

use std::sync::Arc;

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use parking_lot::Mutex;

use crate::common::Result;
use crate::storage::{check_read, FileStore, StorageManager};

/// Cipher block size in bytes.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Decorates another manager so every byte it stores is encrypted.
///
/// The logical length of a store may be any value; the underlying store is
/// always a whole number of cipher blocks long. Writes that cover only part
/// of a cipher block read, decrypt, patch and re-encrypt that block.
pub struct EncryptedStorageManager {
    inner: Arc<dyn StorageManager>,
    cipher: Arc<XexCipher>,
}

impl EncryptedStorageManager {
    /// Wrap `inner` with a freshly generated key pair.
    pub fn new(inner: Arc<dyn StorageManager>) -> Self {
        Self {
            inner,
            cipher: Arc::new(XexCipher::random()),
        }
    }
}

impl StorageManager for EncryptedStorageManager {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        Ok(Arc::new(EncryptedFileStore {
            inner: self.inner.create_file_store(name)?,
            cipher: Arc::clone(&self.cipher),
            length: Mutex::new(0),
        }))
    }

    fn used_space(&self) -> u64 {
        self.inner.used_space()
    }

    fn max_space(&self) -> u64 {
        self.inner.max_space()
    }
}

struct XexCipher {
    data: Aes128,
    tweak: Aes128,
}

impl XexCipher {
    fn random() -> Self {
        let data_key: [u8; 16] = rand::random();
        let tweak_key: [u8; 16] = rand::random();
        Self {
            data: Aes128::new(&data_key.into()),
            tweak: Aes128::new(&tweak_key.into()),
        }
    }

    fn tweak(&self, block_number: u64) -> Block {
        let mut t = Block::default();
        t[..8].copy_from_slice(&block_number.to_le_bytes());
        self.tweak.encrypt_block(&mut t);
        t
    }

    /// Encrypt whole cipher blocks in place; `buf` starts at `first_block`.
    fn encrypt(&self, first_block: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % CIPHER_BLOCK_SIZE, 0);
        for (i, chunk) in buf.chunks_exact_mut(CIPHER_BLOCK_SIZE).enumerate() {
            let t = self.tweak(first_block + i as u64);
            let block = Block::from_mut_slice(chunk);
            xor(block, &t);
            self.data.encrypt_block(block);
            xor(block, &t);
        }
    }

    fn decrypt(&self, first_block: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len() % CIPHER_BLOCK_SIZE, 0);
        for (i, chunk) in buf.chunks_exact_mut(CIPHER_BLOCK_SIZE).enumerate() {
            let t = self.tweak(first_block + i as u64);
            let block = Block::from_mut_slice(chunk);
            xor(block, &t);
            self.data.decrypt_block(block);
            xor(block, &t);
        }
    }
}

#[inline]
fn xor(block: &mut Block, t: &Block) {
    for (b, t) in block.iter_mut().zip(t.iter()) {
        *b ^= t;
    }
}

#[inline]
fn align_down(n: u64) -> u64 {
    n - n % CIPHER_BLOCK_SIZE as u64
}

#[inline]
fn align_up(n: u64) -> u64 {
    n.div_ceil(CIPHER_BLOCK_SIZE as u64) * CIPHER_BLOCK_SIZE as u64
}

struct EncryptedFileStore {
    inner: Arc<dyn FileStore>,
    cipher: Arc<XexCipher>,
    /// Logical length in bytes.
    length: Mutex<u64>,
}

impl EncryptedFileStore {
    /// Write `buf` at `offset` with the length lock held.
    ///
    /// Covers `[min(offset, length), offset + len)` rounded out to cipher
    /// blocks. Bytes at or past the logical length are zeroed before the
    /// patch, so gaps and stale tails read back as zeros.
    fn write_locked(&self, length: &mut u64, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset.min(*length);
        let end = offset + buf.len() as u64;
        if end <= start {
            return Ok(());
        }
        let region_start = align_down(start);
        let region_end = align_up(end);
        let mut region = vec![0u8; (region_end - region_start) as usize];

        let existing_end = region_end.min(self.inner.length());
        if existing_end > region_start {
            let existing = (existing_end - region_start) as usize;
            self.inner
                .read_fully(region_start, &mut region[..existing])?;
            self.cipher.decrypt(
                region_start / CIPHER_BLOCK_SIZE as u64,
                &mut region[..existing],
            );
        }
        if *length < region_end {
            let stale_from = length.saturating_sub(region_start) as usize;
            region[stale_from..].fill(0);
        }

        let at = (offset - region_start) as usize;
        region[at..at + buf.len()].copy_from_slice(buf);
        self.cipher
            .encrypt(region_start / CIPHER_BLOCK_SIZE as u64, &mut region);
        self.inner.write(region_start, &region)?;
        *length = (*length).max(end);
        Ok(())
    }
}

impl FileStore for EncryptedFileStore {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let length = self.length.lock();
        let n = check_read(offset, buf.len(), *length)?;
        if n == 0 {
            return Ok(0);
        }
        let region_start = align_down(offset);
        let region_end = align_up(offset + n as u64);
        let mut region = vec![0u8; (region_end - region_start) as usize];
        self.inner.read_fully(region_start, &mut region)?;
        drop(length);

        self.cipher
            .decrypt(region_start / CIPHER_BLOCK_SIZE as u64, &mut region);
        let at = (offset - region_start) as usize;
        buf[..n].copy_from_slice(&region[at..at + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut length = self.length.lock();
        if buf.is_empty() && offset > *length {
            let gap = vec![0u8; (offset - *length) as usize];
            let from = *length;
            return self.write_locked(&mut length, from, &gap);
        }
        self.write_locked(&mut length, offset, buf)
    }

    fn set_length(&self, new_length: u64) -> Result<()> {
        let mut length = self.length.lock();
        if new_length > *length {
            let zeros = vec![0u8; (new_length - *length) as usize];
            let from = *length;
            return self.write_locked(&mut length, from, &zeros);
        }
        self.inner.set_length(align_up(new_length))?;
        *length = new_length;
        Ok(())
    }

    fn length(&self) -> u64 {
        *self.length.lock()
    }

    fn remove(&self) -> Result<()> {
        let mut length = self.length.lock();
        self.inner.remove()?;
        *length = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::check_store_against_model;
    use crate::storage::MemoryStorageManager;
    use proptest::prelude::*;

    fn create() -> (Arc<dyn FileStore>, EncryptedFileStore) {
        let raw = MemoryStorageManager::new().create_file_store("raw").unwrap();
        let store = EncryptedFileStore {
            inner: Arc::clone(&raw),
            cipher: Arc::new(XexCipher::random()),
            length: Mutex::new(0),
        };
        (raw, store)
    }

    #[test]
    fn test_round_trip_unaligned() {
        let (raw, store) = create();
        store.write(3, b"attack at dawn").unwrap();
        assert_eq!(store.length(), 17);
        assert_eq!(raw.length(), 32);

        let mut buf = [0u8; 17];
        store.read_fully(0, &mut buf).unwrap();
        assert_eq!(&buf[..3], &[0, 0, 0]);
        assert_eq!(&buf[3..], b"attack at dawn");
    }

    #[test]
    fn test_no_plaintext_on_inner_store() {
        let (raw, store) = create();
        let secret = [0x5Au8; 64];
        store.write(0, &secret).unwrap();

        let mut on_disk = [0u8; 64];
        raw.read_fully(0, &mut on_disk).unwrap();
        assert_ne!(on_disk, secret);
        // Equal plaintext blocks are tweaked apart.
        assert_ne!(on_disk[..16], on_disk[16..32]);
    }

    #[test]
    fn test_partial_block_rewrite() {
        let (_raw, store) = create();
        store.write(0, &[1u8; 32]).unwrap();
        store.write(10, &[2u8; 4]).unwrap();

        let mut buf = [0u8; 32];
        store.read_fully(0, &mut buf).unwrap();
        let mut expected = [1u8; 32];
        expected[10..14].fill(2);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_truncate_then_extend_reads_zero() {
        let (_raw, store) = create();
        store.write(0, &[9u8; 20]).unwrap();
        store.set_length(5).unwrap();
        store.set_length(20).unwrap();

        let mut buf = [0xFFu8; 20];
        store.read_fully(0, &mut buf).unwrap();
        assert_eq!(&buf[..5], &[9u8; 5]);
        assert!(buf[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_manager_delegates() {
        let inner = Arc::new(MemoryStorageManager::new());
        let sm = EncryptedStorageManager::new(inner.clone());
        let store = sm.create_file_store("e").unwrap();
        store.write(0, b"x").unwrap();
        assert_eq!(sm.used_space(), CIPHER_BLOCK_SIZE as u64);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]
        #[test]
        fn prop_matches_model(
            ops in prop::collection::vec(
                (0u16..200, prop::collection::vec(any::<u8>(), 0..70), any::<u16>()),
                1..12,
            ),
        ) {
            let (_raw, store) = create();
            check_store_against_model(&store, &ops);
        }
    }
}
