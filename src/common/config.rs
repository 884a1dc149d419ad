//! Configuration for spillcache.
//!
//! Constants here are defaults; everything tunable lives on [`CacheConfig`].

use std::path::PathBuf;

use serde::Deserialize;

use crate::common::{Error, Result};

/// Default size of a block in bytes (8KB).
///
/// Every block-based structure (data blocks, inode table, hash index,
/// bitmap leaves, memory buffer) uses the same block size.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest accepted block size.
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Size of one serialized inode record.
pub const INODE_SIZE: usize = 64;

/// Number of direct block pointers in an inode.
pub const DIRECT_POINTERS: usize = 11;

/// Default lock-striping factor for allocators and the hash index.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

/// Default LRFU decay constant.
pub const DEFAULT_CRF_LAMBDA: f64 = 0.0002;

/// Tuning knobs for the buffer manager and everything below it.
///
/// # Example
/// ```
/// use spillcache::CacheConfig;
///
/// let config = CacheConfig::from_toml_str(
///     r#"
///     memory_buffer_space = 1048576
///     max_storage_object_size = 65536
///     "#,
/// )
/// .unwrap();
/// assert_eq!(config.memory_buffer_space, 1 << 20);
/// assert!(config.storage_directory.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the in-memory segment buffer.
    pub memory_buffer_space: usize,

    /// Largest serialized object the object store keeps.
    pub max_storage_object_size: usize,

    /// Maximum simultaneously open file handles (file storage only).
    pub max_open_files: usize,

    /// Maximum size of one underlying file before splitting, if any.
    pub max_file_size: Option<u64>,

    /// Pre-allocate the whole memory buffer up front.
    pub use_direct_memory: bool,

    /// Directory for spill files. `None` keeps everything in memory.
    pub storage_directory: Option<PathBuf>,

    /// Disk budget across all spill files.
    pub max_buffer_space: u64,

    /// Encrypt spill files with a process-lifetime key.
    pub encrypt_files: bool,

    /// Block size shared by all block structures.
    pub block_size: usize,

    /// Lock-striping factor.
    pub concurrency_level: usize,

    /// LRFU decay constant (larger = recency dominates).
    pub crf_lambda: f64,

    /// Total bytes the reserve pool can hand out.
    pub max_reserve_bytes: usize,

    /// Working-set limit of a single processing operation.
    pub max_processing_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_buffer_space: 64 << 20,
            max_storage_object_size: 8 << 20,
            max_open_files: 64,
            max_file_size: None,
            use_direct_memory: false,
            storage_directory: None,
            max_buffer_space: 50 << 30,
            encrypt_files: false,
            block_size: DEFAULT_BLOCK_SIZE,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            crf_lambda: DEFAULT_CRF_LAMBDA,
            max_reserve_bytes: 256 << 20,
            max_processing_bytes: 16 << 20,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: CacheConfig =
            toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::InvalidConfig(format!(
                "block_size must be a power of two in [{}, {}], got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if self.concurrency_level == 0 {
            return Err(Error::InvalidConfig("concurrency_level must be > 0".into()));
        }
        if self.max_open_files == 0 {
            return Err(Error::InvalidConfig("max_open_files must be > 0".into()));
        }
        if let Some(max) = self.max_file_size {
            if max < self.block_size as u64 {
                return Err(Error::InvalidConfig(format!(
                    "max_file_size {} is smaller than a block",
                    max
                )));
            }
        }
        if !(self.crf_lambda > 0.0 && self.crf_lambda.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "crf_lambda must be positive, got {}",
                self.crf_lambda
            )));
        }
        if self.max_buffer_space < self.block_size as u64 {
            return Err(Error::InvalidConfig(
                "max_buffer_space must hold at least one block".into(),
            ));
        }
        Ok(())
    }

    /// Largest object an inode can address with this block size.
    pub fn inode_capacity(&self) -> usize {
        inode_capacity(self.block_size)
    }

    /// Number of data blocks the disk budget allows.
    pub fn max_data_blocks(&self) -> usize {
        let blocks = self.max_buffer_space / self.block_size as u64;
        blocks.min(i32::MAX as u64) as usize
    }
}

/// Bytes addressable by one inode: direct blocks plus one indirect block.
pub fn inode_capacity(block_size: usize) -> usize {
    (DIRECT_POINTERS + block_size / 4) * block_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_block_size_is_power_of_two() {
        assert!(DEFAULT_BLOCK_SIZE.is_power_of_two());
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inode_layout_fits_record() {
        // direct pointers + indirect + length + generation + checksum
        assert_eq!(DIRECT_POINTERS * 4 + 4 + 8 + 4 + 4, INODE_SIZE);
    }

    #[test]
    fn test_inode_capacity() {
        assert_eq!(inode_capacity(512), (11 + 128) * 512);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let config = CacheConfig {
            block_size: 1000,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_from_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            block_size = 4096
            storage_directory = "/tmp/spill"
            max_file_size = 1048576
            encrypt_files = true
            "#,
        )
        .unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.storage_directory, Some(PathBuf::from("/tmp/spill")));
        assert_eq!(config.max_file_size, Some(1 << 20));
        assert!(config.encrypt_files);
        assert_eq!(config.concurrency_level, DEFAULT_CONCURRENCY_LEVEL);
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(CacheConfig::from_toml_str("block_size = \"big\"").is_err());
        assert!(CacheConfig::from_toml_str("concurrency_level = 0").is_err());
    }
}
