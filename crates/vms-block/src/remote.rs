//! Read-only backend over a remote blob or managed-disk service.
//!
//! The service client itself lives outside this crate and is supplied as a
//! [`BlobSource`]. This backend only splits large reads into bounded range
//! requests and keeps request statistics, which are logged when the disk is
//! closed.

use crate::{DiskBackend, check_range};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};
use vms_error::{Result, VmsError};

/// Largest single range request issued to a [`BlobSource`].
pub const MAX_READ_LEN: usize = 4 * 1024 * 1024;

/// Client side of a remote blob store.
pub trait BlobSource: Send + Sync + fmt::Debug {
    /// Locator used in logs and errors (URI, blob name, disk id).
    fn locator(&self) -> &str;

    /// Size of the blob in bytes.
    fn content_length(&self) -> Result<u64>;

    /// Fill `buf` with the bytes at `[offset, offset + buf.len())`.
    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Drop connections held by the client.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Request counters for a remote backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStats {
    /// Calls to `read_exact_at`.
    pub reads: u64,
    /// Range requests sent to the source.
    pub requests: u64,
    /// Reads that needed more than one request.
    pub split_reads: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct RemoteBlobBackend {
    source: Arc<dyn BlobSource>,
    len: u64,
    stats: Mutex<RemoteStats>,
    closed: AtomicBool,
}

impl RemoteBlobBackend {
    pub fn open(source: Arc<dyn BlobSource>) -> Result<Self> {
        let len = source.content_length()?;
        debug!(locator = source.locator(), len, "opened remote blob");
        Ok(Self {
            source,
            len,
            stats: Mutex::new(RemoteStats::default()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn stats(&self) -> RemoteStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn locator(&self) -> &str {
        self.source.locator()
    }
}

impl DiskBackend for RemoteBlobBackend {
    fn kind(&self) -> &'static str {
        "remote-blob"
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.is_closed() {
            return Err(VmsError::Closed(self.source.locator().to_owned()));
        }
        check_range("remote-blob", offset, buf.len(), self.len)?;
        let mut requests = 0_u64;
        for (i, chunk) in buf.chunks_mut(MAX_READ_LEN).enumerate() {
            let chunk_offset = offset + (i * MAX_READ_LEN) as u64;
            trace!(locator = self.source.locator(), chunk_offset, len = chunk.len(), "range request");
            self.source.read_range(chunk_offset, chunk)?;
            requests += 1;
        }
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.requests += requests;
        if requests > 1 {
            stats.split_reads += 1;
        }
        stats.bytes += buf.len() as u64;
        Ok(())
    }

    fn write_all_at(&self, _offset: u64, _buf: &[u8]) -> Result<()> {
        Err(VmsError::unsupported_op(
            "write",
            format!("remote blob {}", self.source.locator()),
        ))
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let stats = self.stats();
        debug!(
            locator = self.source.locator(),
            reads = stats.reads,
            requests = stats.requests,
            split_reads = stats.split_reads,
            bytes = stats.bytes,
            "remote blob read statistics"
        );
        self.source.close()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Debug)]
    struct FakeBlob {
        data: Vec<u8>,
        calls: AtomicU64,
        closes: AtomicU64,
    }

    impl FakeBlob {
        fn new(len: usize) -> Self {
            Self {
                data: (0..len).map(|i| (i % 253) as u8).collect(),
                calls: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }
        }
    }

    impl BlobSource for FakeBlob {
        fn locator(&self) -> &str {
            "https://blobs.invalid/vhds/disk0.vhd"
        }

        fn content_length(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            assert!(buf.len() <= MAX_READ_LEN, "request exceeds split size");
            self.calls.fetch_add(1, Ordering::Relaxed);
            let start = usize::try_from(offset).expect("offset");
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn large_reads_are_split_at_max_read_len() {
        let blob = Arc::new(FakeBlob::new(MAX_READ_LEN * 2 + 100));
        let dev = RemoteBlobBackend::open(Arc::clone(&blob) as Arc<dyn BlobSource>).expect("open");
        let mut buf = vec![0_u8; MAX_READ_LEN * 2 + 10];
        dev.read_exact_at(50, &mut buf).expect("read");
        assert_eq!(buf[..], blob.data[50..50 + buf.len()]);
        assert_eq!(blob.calls.load(Ordering::Relaxed), 3);

        let stats = dev.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.split_reads, 1);
        assert_eq!(stats.bytes, buf.len() as u64);
    }

    #[test]
    fn writes_are_unsupported() {
        let dev = RemoteBlobBackend::open(Arc::new(FakeBlob::new(1024))).expect("open");
        let err = dev.write_all_at(0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, VmsError::UnsupportedOperation { .. }));
        assert!(!dev.is_writable());
    }

    #[test]
    fn close_releases_source_once() {
        let blob = Arc::new(FakeBlob::new(1024));
        let dev = RemoteBlobBackend::open(Arc::clone(&blob) as Arc<dyn BlobSource>).expect("open");
        dev.close().expect("close");
        dev.close().expect("close again");
        assert_eq!(blob.closes.load(Ordering::Relaxed), 1);
        let mut buf = [0_u8; 4];
        assert!(matches!(dev.read_exact_at(0, &mut buf), Err(VmsError::Closed(_))));
    }
}
