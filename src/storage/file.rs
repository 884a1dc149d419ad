//! File Storage Manager - spill files under a directory.
//!
//! The [`FileStorageManager`] handles all direct file operations:
//! - Creating one file per store
//! - Enforcing the total buffer-space limit
//! - Bounding the number of simultaneously open file handles

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{Error, Result};
use crate::storage::{check_read, FileStore, StorageManager};

/// Creates one file per store under a configured directory.
///
/// # File Layout
/// ```text
/// <directory>/
///   inodes_0.bin
///   data_1.bin
///   index_2.bin
///   ...
/// ```
///
/// Files are scratch space: a store's file is deleted when the store is
/// removed or dropped. Nothing is fsync'd.
///
/// # Limits
/// - `max_buffer_space`: total bytes across all files; a write that would
///   exceed it fails with `Error::OutOfDiskSpace`.
/// - `max_open_files`: open handles are cached; opening one more closes the
///   least recently used handle. A handle in use by another thread stays open
///   until that thread is done with it.
pub struct FileStorageManager {
    inner: Arc<Inner>,
}

struct Inner {
    directory: PathBuf,
    max_buffer_space: u64,
    max_open_files: usize,
    used: AtomicU64,
    next_id: AtomicU64,
    handles: Mutex<HandleCache>,
}

/// LRU cache of open file handles, keyed by store id.
#[derive(Default)]
struct HandleCache {
    open: HashMap<u64, (Arc<File>, u64)>,
    tick: u64,
}

impl FileStorageManager {
    /// Create a manager rooted at `directory`.
    ///
    /// Call [`StorageManager::initialize`] before creating stores.
    ///
    /// # Panics
    /// Panics if `max_open_files` is 0.
    pub fn new<P: AsRef<Path>>(directory: P, max_buffer_space: u64, max_open_files: usize) -> Self {
        assert!(max_open_files > 0, "max_open_files must be > 0");
        Self {
            inner: Arc::new(Inner {
                directory: directory.as_ref().to_path_buf(),
                max_buffer_space,
                max_open_files,
                used: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                handles: Mutex::new(HandleCache::default()),
            }),
        }
    }

    /// The spill directory.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Number of file handles currently cached open.
    pub fn open_file_count(&self) -> usize {
        self.inner.handles.lock().open.len()
    }
}

impl StorageManager for FileStorageManager {
    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.inner.directory)?;
        info!(
            directory = %self.inner.directory.display(),
            max_buffer_space = self.inner.max_buffer_space,
            max_open_files = self.inner.max_open_files,
            "file storage initialized"
        );
        Ok(())
    }

    fn create_file_store(&self, name: &str) -> Result<Arc<dyn FileStore>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self.inner.directory.join(format!("{}_{}.bin", safe, id));
        // Create eagerly so a bad directory fails here rather than on first write.
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.display(), "created spill file");
        Ok(Arc::new(DiskFileStore {
            id,
            path,
            length: Mutex::new(0),
            removed: AtomicBool::new(false),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn used_space(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }

    fn max_space(&self) -> u64 {
        self.inner.max_buffer_space
    }
}

impl Inner {
    /// Get (or open) the handle for store `id`, closing the LRU handle if full.
    fn handle(&self, id: u64, path: &Path) -> Result<Arc<File>> {
        let mut cache = self.handles.lock();
        cache.tick += 1;
        let tick = cache.tick;
        if let Some((file, last_used)) = cache.open.get_mut(&id) {
            *last_used = tick;
            return Ok(Arc::clone(file));
        }
        if cache.open.len() >= self.max_open_files {
            let victim = cache
                .open
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(&victim, _)| victim);
            if let Some(victim) = victim {
                cache.open.remove(&victim);
            }
        }
        let file = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);
        cache.open.insert(id, (Arc::clone(&file), tick));
        Ok(file)
    }

    fn close(&self, id: u64) {
        self.handles.lock().open.remove(&id);
    }

    /// Account for `delta` more bytes, failing if over the limit.
    fn reserve(&self, delta: u64) -> Result<()> {
        let before = self.used.fetch_add(delta, Ordering::SeqCst);
        let requested = before + delta;
        if requested > self.max_buffer_space {
            self.used.fetch_sub(delta, Ordering::SeqCst);
            warn!(
                requested,
                limit = self.max_buffer_space,
                "spill space exhausted"
            );
            return Err(Error::OutOfDiskSpace {
                requested,
                limit: self.max_buffer_space,
            });
        }
        Ok(())
    }

    fn release(&self, delta: u64) {
        self.used.fetch_sub(delta, Ordering::SeqCst);
    }
}

/// One spill file.
struct DiskFileStore {
    id: u64,
    path: PathBuf,
    /// Logical length; also serializes writers.
    length: Mutex<u64>,
    removed: AtomicBool,
    inner: Arc<Inner>,
}

impl DiskFileStore {
    fn check_live(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) {
            return Err(Error::StoreRemoved(self.path.display().to_string()));
        }
        Ok(())
    }

    fn file(&self) -> Result<Arc<File>> {
        self.inner.handle(self.id, &self.path)
    }
}

impl FileStore for DiskFileStore {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_live()?;
        let n = check_read(offset, buf.len(), *self.length.lock())?;
        if n > 0 {
            let file = self.file()?;
            read_exact_at(&file, &mut buf[..n], offset)?;
        }
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_live()?;
        let mut length = self.length.lock();
        let end = offset + buf.len() as u64;
        if end > *length {
            self.inner.reserve(end - *length)?;
        }
        let file = self.file()?;
        let written = if buf.is_empty() && end > *length {
            file.set_len(end)
        } else {
            write_all_at(&file, buf, offset)
        };
        if let Err(e) = written {
            if end > *length {
                self.inner.release(end - *length);
            }
            return Err(e.into());
        }
        // Writing past EOF leaves a hole, which reads back as zeros.
        *length = (*length).max(end);
        Ok(())
    }

    fn set_length(&self, new_length: u64) -> Result<()> {
        self.check_live()?;
        let mut length = self.length.lock();
        if new_length > *length {
            self.inner.reserve(new_length - *length)?;
        }
        self.file()?.set_len(new_length)?;
        if new_length < *length {
            self.inner.release(*length - new_length);
        }
        *length = new_length;
        Ok(())
    }

    fn length(&self) -> u64 {
        *self.length.lock()
    }

    fn remove(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut length = self.length.lock();
        self.inner.close(self.id);
        self.inner.release(*length);
        *length = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DiskFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "failed to remove spill file");
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
