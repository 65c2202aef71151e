//! LRU block cache decorator.
//!
//! Wraps a slow backend (remote blob, network block device) and serves
//! whole aligned blocks from memory. Write-through: writes go to the inner
//! backend first, then refresh any cached copy of the touched blocks.

use crate::{DiskBackend, LruCache, check_range};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use vms_error::{Result, VmsError};

/// Sizing of a [`CachedBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cached block size in bytes; power of two, at least 512.
    pub block_size: u32,
    /// Maximum number of resident blocks.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(VmsError::InvalidConfig(format!(
                "cache block_size={} must be a power of two >= 512",
                self.block_size
            )));
        }
        if self.capacity == 0 {
            return Err(VmsError::InvalidConfig(
                "cache capacity must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CachedBackend {
    inner: Arc<dyn DiskBackend>,
    block_size: u64,
    blocks: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn DiskBackend>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            block_size: u64::from(config.block_size),
            blocks: Mutex::new(LruCache::new(config.capacity)?),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn DiskBackend> {
        &self.inner
    }

    /// `(hits, misses)` of the block cache.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        self.blocks.lock().stats()
    }

    fn load_block(&self, index: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = self.blocks.lock().get_cloned(&index) {
            return Ok(block);
        }
        let start = index * self.block_size;
        let len = self.block_size.min(self.inner.len_bytes().saturating_sub(start));
        let mut buf = vec![0_u8; usize::try_from(len).unwrap_or(0)];
        self.inner.read_exact_at(start, &mut buf)?;
        let block = Arc::new(buf);
        self.blocks.lock().insert(index, Arc::clone(&block));
        Ok(block)
    }
}

impl DiskBackend for CachedBackend {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("cache", offset, buf.len(), self.len_bytes())?;
        let mut pos = offset;
        let mut done = 0_usize;
        while done < buf.len() {
            let index = pos / self.block_size;
            let within = usize::try_from(pos % self.block_size).unwrap_or(0);
            let block = self.load_block(index)?;
            let n = (block.len() - within).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&block[within..within + n]);
            done += n;
            pos += n as u64;
        }
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.write_all_at(offset, buf)?;
        let end = offset + buf.len() as u64;
        let first = offset / self.block_size;
        let last = end.saturating_sub(1) / self.block_size;
        let mut blocks = self.blocks.lock();
        for index in first..=last {
            let _ = blocks.remove(&index);
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> Result<()> {
        let (hits, misses) = {
            let mut blocks = self.blocks.lock();
            let stats = blocks.stats();
            blocks.clear();
            stats
        };
        debug!(kind = self.inner.kind(), hits, misses, "block cache released");
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn parent(&self) -> Option<Arc<dyn DiskBackend>> {
        self.inner.parent()
    }

    fn take_parent(&self) -> Option<Arc<dyn DiskBackend>> {
        self.inner.take_parent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn rejects_invalid_config() {
        let inner: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(1024));
        let bad = CacheConfig {
            block_size: 1000,
            capacity: 4,
        };
        assert!(CachedBackend::new(Arc::clone(&inner), bad).is_err());
        let empty = CacheConfig {
            block_size: 512,
            capacity: 0,
        };
        assert!(CachedBackend::new(inner, empty).is_err());
    }

    #[test]
    fn reads_across_blocks_and_hits_on_reread() {
        let data = patterned(10_000);
        let inner: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(data.clone()));
        let cache = CachedBackend::new(
            inner,
            CacheConfig {
                block_size: 1024,
                capacity: 4,
            },
        )
        .expect("cache");

        let mut buf = vec![0_u8; 3000];
        cache.read_exact_at(500, &mut buf).expect("read");
        assert_eq!(buf, data[500..3500]);
        cache.read_exact_at(500, &mut buf).expect("reread");
        let (hits, misses) = cache.stats();
        assert_eq!(misses, 4);
        assert_eq!(hits, 4);

        // Tail block shorter than block_size.
        let mut tail = vec![0_u8; 16];
        cache.read_exact_at(9_984, &mut tail).expect("tail");
        assert_eq!(tail, data[9_984..]);
    }

    #[test]
    fn writes_invalidate_cached_blocks() {
        let inner: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(4096));
        let cache = CachedBackend::new(
            inner,
            CacheConfig {
                block_size: 512,
                capacity: 8,
            },
        )
        .expect("cache");
        let mut buf = [0_u8; 4];
        cache.read_exact_at(1000, &mut buf).expect("prime");
        cache.write_all_at(1000, b"data").expect("write");
        cache.read_exact_at(1000, &mut buf).expect("read");
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn close_reaches_inner() {
        let inner: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(1024));
        let cache = CachedBackend::new(Arc::clone(&inner), CacheConfig::default()).expect("cache");
        cache.close().expect("close");
        cache.close().expect("close twice");
        assert!(inner.is_closed());
    }
}
