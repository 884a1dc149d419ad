//! Caller-supplied serialization and the entries it produces.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::common::Result;

/// Turns cached values into bytes and back.
///
/// The cache never inspects payloads; it only moves the bytes a serializer
/// produces. `serialize` may be stopped part way through (for example when
/// the object grows past the store's maximum), so it must not assume the
/// writer accepts everything.
pub trait Serializer<T>: Send + Sync {
    /// Write `value` to `out`.
    fn serialize(&self, value: &T, out: &mut dyn Write) -> Result<()>;

    /// Read a value back from `input`. `input` ends where the object ends.
    fn deserialize(&self, input: &mut dyn Read) -> Result<T>;

    /// Identifier recorded with every entry this serializer writes.
    fn id(&self) -> i64;

    /// Whether entries are cheap to recompute and should be evicted first.
    fn use_soft_cache(&self) -> bool {
        false
    }
}

/// A cached value and the id it is stored under.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub id: i64,
    pub payload: Arc<T>,
}

impl<T> CacheEntry<T> {
    /// Wrap `payload` under `id`.
    pub fn new(id: i64, payload: T) -> Self {
        Self {
            id,
            payload: Arc::new(payload),
        }
    }

    /// Wrap an already shared payload.
    pub fn from_arc(id: i64, payload: Arc<T>) -> Self {
        Self { id, payload }
    }
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// Serializer for raw byte payloads.
///
/// # Example
/// ```
/// use spillcache::buffer::{BytesSerializer, Serializer};
///
/// let s = BytesSerializer::new(1);
/// let mut out = Vec::new();
/// s.serialize(&vec![1, 2, 3], &mut out).unwrap();
/// let back = s.deserialize(&mut out.as_slice()).unwrap();
/// assert_eq!(back, vec![1, 2, 3]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer {
    id: i64,
    soft: bool,
}

impl BytesSerializer {
    pub fn new(id: i64) -> Self {
        Self { id, soft: false }
    }

    /// A serializer whose entries go to the soft (evict-first) tier.
    pub fn soft(id: i64) -> Self {
        Self { id, soft: true }
    }
}

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<()> {
        out.write_all(value)?;
        Ok(())
    }

    fn deserialize(&self, input: &mut dyn Read) -> Result<Vec<u8>> {
        let mut value = Vec::new();
        input.read_to_end(&mut value)?;
        Ok(value)
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn use_soft_cache(&self) -> bool {
        self.soft
    }
}
