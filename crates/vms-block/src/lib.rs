#![forbid(unsafe_code)]
//! Byte-addressed backing stores for the disk chain.
//!
//! Provides the [`DiskBackend`] trait every layer of the storage stack
//! implements, plus the leaf backends (local file or block device, memory,
//! remote blob), a non-owning [`WindowBackend`] used by partitions and
//! volumes, and an LRU block cache decorator.
//!
//! Ownership rule: a backend that opened a handle closes it. Windows and
//! other borrowing views never close what they wrap.

pub mod cache;
pub mod lru;
pub mod remote;

pub use cache::{CacheConfig, CachedBackend};
pub use lru::LruCache;
pub use remote::{BlobSource, MAX_READ_LEN, RemoteBlobBackend, RemoteStats};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;
use vms_error::{Result, VmsError};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Whether a backend may be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Byte-addressed device with pread/pwrite semantics.
///
/// Offsets are absolute within the backend's own coordinate space. Callers
/// clamp ranges to [`DiskBackend::len_bytes`]; an out-of-range access is a
/// structural error, not a short read.
pub trait DiskBackend: Send + Sync + fmt::Debug {
    /// Short name of the format or source ("raw", "vmdk-sparse", ...).
    fn kind(&self) -> &'static str;

    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn is_writable(&self) -> bool;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Release the resources this backend owns. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Logical sector size reported by the format.
    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    /// Copy-on-write parent consulted for unallocated regions, if any.
    fn parent(&self) -> Option<Arc<dyn DiskBackend>> {
        None
    }

    /// Detach the parent so closing this backend leaves it open.
    fn take_parent(&self) -> Option<Arc<dyn DiskBackend>> {
        None
    }
}

/// Validate that `[offset, offset + len)` lies within `dev_len`.
pub fn check_range(kind: &str, offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| VmsError::Format("I/O length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| VmsError::Format("I/O range overflows u64".to_owned()))?;
    if end > dev_len {
        return Err(VmsError::Format(format!(
            "{kind}: access out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// Local file or raw block device accessed with `pread`/`pwrite`.
///
/// Writes past the current end extend the file, which sparse formats rely
/// on when allocating new grains.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<Option<Arc<File>>>,
    len: AtomicU64,
    writable: bool,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode.is_writable())
            .open(path)?;
        // Block devices report a zero metadata length; seeking works for both.
        let len = file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), len, ?mode, "opened backing file");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(Arc::new(file))),
            len: AtomicU64::new(len),
            writable: mode.is_writable(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<File>> {
        self.file
            .lock()
            .clone()
            .ok_or_else(|| VmsError::Closed(self.path.display().to_string()))
    }
}

impl DiskBackend for FileBackend {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn len_bytes(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.handle()?;
        check_range("file", offset, buf.len(), self.len_bytes())?;
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.handle()?;
        if !self.writable {
            return Err(VmsError::ReadOnly);
        }
        let end = offset
            .checked_add(u64::try_from(buf.len()).map_err(|_| {
                VmsError::Format("write length overflows u64".to_owned())
            })?)
            .ok_or_else(|| VmsError::Format("write range overflows u64".to_owned()))?;
        file.write_all_at(buf, offset)?;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.handle()?.sync_all()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(file) = self.file.lock().take() {
            if self.writable {
                file.sync_all()?;
            }
            debug!(path = %self.path.display(), "closed backing file");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.lock().is_none()
    }
}

/// In-memory backend, growable on write.
#[derive(Debug)]
pub struct MemoryBackend {
    bytes: Mutex<Vec<u8>>,
    writable: bool,
    closed: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            writable: true,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn read_only(bytes: Vec<u8>) -> Self {
        Self {
            writable: false,
            ..Self::new(bytes)
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VmsError::Closed("memory backend".to_owned()));
        }
        Ok(())
    }
}

impl DiskBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        let bytes = self.bytes.lock();
        check_range("memory", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX))?;
        let start = usize::try_from(offset)
            .map_err(|_| VmsError::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.writable {
            return Err(VmsError::ReadOnly);
        }
        let start = usize::try_from(offset)
            .map_err(|_| VmsError::Format("offset overflows usize".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| VmsError::Format("write range overflows usize".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// View of `[start, start + len)` on another backend.
///
/// Partitions and physical-volume views are borrowing windows and never
/// close the backend they wrap. Raw-disk offsets and fixed-size formats use
/// an owning window, which closes its inner backend.
#[derive(Debug, Clone)]
pub struct WindowBackend {
    inner: Arc<dyn DiskBackend>,
    start: u64,
    len: u64,
    owns_inner: bool,
}

impl WindowBackend {
    /// Borrowing window.
    pub fn new(inner: Arc<dyn DiskBackend>, start: u64, len: u64) -> Result<Self> {
        Self::build(inner, start, len, false)
    }

    /// Window that takes ownership of `inner` and closes it on close.
    pub fn owning(inner: Arc<dyn DiskBackend>, start: u64, len: u64) -> Result<Self> {
        Self::build(inner, start, len, true)
    }

    fn build(inner: Arc<dyn DiskBackend>, start: u64, len: u64, owns_inner: bool) -> Result<Self> {
        let end = start
            .checked_add(len)
            .ok_or_else(|| VmsError::Format("window range overflows u64".to_owned()))?;
        if end > inner.len_bytes() {
            return Err(VmsError::Format(format!(
                "window [{start}, {end}) exceeds {} device of {} bytes",
                inner.kind(),
                inner.len_bytes()
            )));
        }
        Ok(Self {
            inner,
            start,
            len,
            owns_inner,
        })
    }

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn DiskBackend> {
        &self.inner
    }
}

impl DiskBackend for WindowBackend {
    fn kind(&self) -> &'static str {
        "window"
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("window", offset, buf.len(), self.len)?;
        self.inner.read_exact_at(self.start + offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range("window", offset, buf.len(), self.len)?;
        self.inner.write_all_at(self.start + offset, buf)
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> Result<()> {
        if self.owns_inner {
            self.inner.close()?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }
}

/// Read up to `buf.len()` bytes at `offset`, clamped to the device end.
/// Returns the number of bytes read.
pub fn read_clamped(dev: &dyn DiskBackend, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let len = dev.len_bytes();
    if offset >= len {
        return Ok(0);
    }
    let avail = usize::try_from(len - offset).unwrap_or(usize::MAX);
    let n = buf.len().min(avail);
    dev.read_exact_at(offset, &mut buf[..n])?;
    Ok(n)
}
