//! Storage manager that splits large stores across several underlying stores.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::common::Result;
use crate::storage::{check_read, FileStore, StorageManager};

/// Decorates another manager so no underlying store exceeds `max_file_size`.
///
/// ```text
/// logical:   [0 ............................................ length)
/// segments:  [ seg 0: max_file_size ][ seg 1: max_file_size ][ seg 2 )
/// ```
///
/// Reads and writes that cross a segment boundary are split and dispatched
/// to each segment in turn.
pub struct SplittableStorageManager {
    inner: Arc<dyn StorageManager>,
    max_file_size: u64,
}

impl SplittableStorageManager {
    /// Wrap `inner`, capping each underlying store at `max_file_size` bytes.
    ///
    /// # Panics
    /// Panics if `max_file_size` is 0.
    pub fn new(inner: Arc<dyn StorageManager>, max_file_size: u64) -> Self {
        assert!(max_file_size > 0, "max_file_size must be > 0");
        Self {
            inner,
            max_file_size,
        }
    }

    /// Segment size in bytes.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }
}

impl StorageManager for SplittableStorageManager {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        Ok(Arc::new(SplittableFileStore {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
            max_file_size: self.max_file_size,
            state: RwLock::new(SplitState {
                segments: Vec::new(),
                length: 0,
            }),
        }))
    }

    fn used_space(&self) -> u64 {
        self.inner.used_space()
    }

    fn max_space(&self) -> u64 {
        self.inner.max_space()
    }
}

struct SplitState {
    segments: Vec<Arc<dyn FileStore>>,
    length: u64,
}

struct SplittableFileStore {
    inner: Arc<dyn StorageManager>,
    name: String,
    max_file_size: u64,
    state: RwLock<SplitState>,
}

impl SplittableFileStore {
    /// Make sure segments exist up to and including `index`.
    fn ensure_segments(&self, state: &mut SplitState, index: usize) -> Result<()> {
        while state.segments.len() <= index {
            let name = format!("{}_{}", self.name, state.segments.len());
            trace!(store = %self.name, segment = state.segments.len(), "adding segment");
            state.segments.push(self.inner.create_file_store(&name)?);
        }
        Ok(())
    }

    /// Split `[offset, offset + len)` into `(segment, segment offset, range in buf)`.
    fn pieces(&self, offset: u64, len: usize) -> Vec<(usize, u64, std::ops::Range<usize>)> {
        let mut out = Vec::new();
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let segment = (pos / self.max_file_size) as usize;
            let seg_offset = pos % self.max_file_size;
            let n = ((self.max_file_size - seg_offset) as usize).min(len - done);
            out.push((segment, seg_offset, done..done + n));
            done += n;
        }
        out
    }
}

impl FileStore for SplittableFileStore {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.read();
        let n = check_read(offset, buf.len(), state.length)?;
        for (segment, seg_offset, range) in self.pieces(offset, n) {
            state.segments[segment].read_fully(seg_offset, &mut buf[range])?;
        }
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            if offset > self.length() {
                return self.set_length(offset);
            }
            return Ok(());
        }
        let mut state = self.state.write();
        let end = offset + buf.len() as u64;
        let last = ((end - 1) / self.max_file_size) as usize;
        self.ensure_segments(&mut state, last)?;
        // Earlier segments must be full-length so gaps read back as zeros.
        if end > state.length {
            let first = (offset / self.max_file_size) as usize;
            for segment in state.segments.iter().take(first) {
                if segment.length() < self.max_file_size {
                    segment.set_length(self.max_file_size)?;
                }
            }
        }
        for (segment, seg_offset, range) in self.pieces(offset, buf.len()) {
            state.segments[segment].write(seg_offset, &buf[range])?;
        }
        state.length = state.length.max(end);
        Ok(())
    }

    fn set_length(&self, length: u64) -> Result<()> {
        let mut state = self.state.write();
        let needed = length.div_ceil(self.max_file_size) as usize;
        if needed > 0 {
            self.ensure_segments(&mut state, needed - 1)?;
        }
        while state.segments.len() > needed {
            if let Some(segment) = state.segments.pop() {
                segment.remove()?;
            }
        }
        for (i, segment) in state.segments.iter().enumerate() {
            let seg_start = i as u64 * self.max_file_size;
            let seg_len = (length - seg_start).min(self.max_file_size);
            if segment.length() != seg_len {
                segment.set_length(seg_len)?;
            }
        }
        state.length = length;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.state.read().length
    }

    fn remove(&self) -> Result<()> {
        let mut state = self.state.write();
        for segment in state.segments.drain(..) {
            segment.remove()?;
        }
        state.length = 0;
        Ok(())
    }
}
