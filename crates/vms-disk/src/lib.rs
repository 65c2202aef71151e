#![forbid(unsafe_code)]
//! Virtual disks: descriptors, format stacking and partition discovery.
//!
//! A [`Disk`] is opened from a [`DiskDescriptor`]. The source is opened as a
//! leaf backend, the [`FormatRegistry`] probe chain wraps it in format layers
//! (VMware sparse, VHD) until nothing else matches, and the result is the
//! byte-addressable device seen by everything above. Partitions are
//! discovered lazily and returned as further `Disk` values windowed onto the
//! same backend.
//!
//! Only the whole disk owns its backend. Partition disks share the handle
//! and never close it.

pub mod descriptor;
pub mod partition;
pub mod probe;
pub mod vhd;
pub mod vhdx;
pub mod vmdk;

pub use descriptor::{DiskDescriptor, DiskSource, MAX_PARENT_DEPTH};
pub use partition::{PartitionKind, PartitionScan, PartitionScheme, PartitionTableEntry};
pub use probe::{DiskFormat, FormatContext, FormatRegistry, MAX_FORMAT_LAYERS};

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vms_block::{
    AccessMode, CachedBackend, DiskBackend, FileBackend, RemoteBlobBackend, WindowBackend,
};
use vms_error::{Result, VmsError};

/// Reference point for [`Disk::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A node in the disk chain: a whole disk or one of its partitions.
#[derive(Debug)]
pub struct Disk {
    name: String,
    backend: Arc<dyn DiskBackend>,
    owns_backend: bool,
    start_byte: u64,
    end_byte: u64,
    block_size: u64,
    pos: u64,
    partition: Option<PartitionTableEntry>,
    disk_signature: Option<u32>,
    hardware_id: Option<String>,
    partitions: Option<Vec<Disk>>,
    scheme: Option<PartitionScheme>,
    closed: bool,
}

impl Disk {
    /// Open the disk `desc` describes, stacking every detected format.
    pub fn open(desc: &DiskDescriptor, registry: &FormatRegistry) -> Result<Self> {
        desc.validate()?;
        let name = desc.display_name();
        let backend = open_chain(desc, registry, &name, desc.mode, 0)?;
        let mut disk = Self::from_backend(name, backend)?;
        disk.hardware_id.clone_from(&desc.hardware_id);
        info!(
            disk = %disk.name,
            format = disk.backend.kind(),
            size = disk.size(),
            base_only = desc.base_only,
            "opened disk"
        );
        Ok(disk)
    }

    /// Wrap an already-stacked backend as a whole disk. The disk takes
    /// ownership of `backend` and closes it.
    pub fn from_backend(name: impl Into<String>, backend: Arc<dyn DiskBackend>) -> Result<Self> {
        let name = name.into();
        let disk_signature = match partition::read_disk_signature(backend.as_ref()) {
            Ok(sig) => sig,
            Err(err) => {
                let _ = backend.close();
                return Err(err);
            }
        };
        let block_size = u64::from(backend.sector_size());
        Ok(Self {
            name,
            end_byte: backend.len_bytes(),
            backend,
            owns_backend: true,
            start_byte: 0,
            block_size,
            pos: 0,
            partition: None,
            disk_signature,
            hardware_id: None,
            partitions: None,
            scheme: None,
            closed: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First byte of this disk on the backing device.
    #[must_use]
    pub fn start_byte(&self) -> u64 {
        self.start_byte
    }

    /// One past the last byte of this disk on the backing device.
    #[must_use]
    pub fn end_byte(&self) -> u64 {
        self.end_byte
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.end_byte - self.start_byte
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Partition number; 0 for the whole disk.
    #[must_use]
    pub fn partition_number(&self) -> u32 {
        self.partition.as_ref().map_or(0, |p| p.index)
    }

    /// DOS type code of this partition; 0 for the whole disk.
    #[must_use]
    pub fn partition_type(&self) -> u8 {
        self.partition.as_ref().map_or(0, |p| p.kind.type_code())
    }

    #[must_use]
    pub fn partition_entry(&self) -> Option<&PartitionTableEntry> {
        self.partition.as_ref()
    }

    #[must_use]
    pub fn disk_signature(&self) -> Option<u32> {
        self.disk_signature
    }

    #[must_use]
    pub fn hardware_id(&self) -> Option<&str> {
        self.hardware_id.as_deref()
    }

    /// Name of the top format layer ("vmdk-sparse", "file", ...).
    #[must_use]
    pub fn format(&self) -> &'static str {
        self.backend.kind()
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.backend.is_writable()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(VmsError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Move the cursor. Returns the new position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        self.ensure_open()?;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos,
            Whence::End => self.size(),
        };
        let target = base.checked_add_signed(offset).ok_or_else(|| {
            VmsError::InvalidConfig(format!(
                "{}: seek to {base}{offset:+} is out of range",
                self.name
            ))
        })?;
        self.pos = target;
        Ok(target)
    }

    /// Read up to `len` bytes at the cursor. The result is shorter than
    /// `len` only at the end of the disk.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        let n = self.read_at(self.pos, &mut buf)?;
        buf.truncate(n);
        self.pos += n as u64;
        Ok(buf)
    }

    /// Write `buf` at the cursor, clamped to the disk end. Returns the
    /// number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if !self.backend.is_writable() {
            return Err(VmsError::unsupported_op(
                "write",
                format!("{} ({})", self.name, self.backend.kind()),
            ));
        }
        let avail = self.size().saturating_sub(self.pos);
        let n = buf.len().min(usize::try_from(avail).unwrap_or(usize::MAX));
        self.backend
            .write_all_at(self.start_byte + self.pos, &buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Positional read that leaves the cursor alone.
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if pos >= self.size() {
            return Ok(0);
        }
        let avail = self.size() - pos;
        let n = buf.len().min(usize::try_from(avail).unwrap_or(usize::MAX));
        self.backend
            .read_exact_at(self.start_byte + pos, &mut buf[..n])?;
        Ok(n)
    }

    /// Borrowing backend covering exactly this disk. Closing the view is a
    /// no-op; the disk stays the owner.
    pub fn view(&self) -> Result<Arc<dyn DiskBackend>> {
        self.ensure_open()?;
        Ok(Arc::new(WindowBackend::new(
            Arc::clone(&self.backend),
            self.start_byte,
            self.size(),
        )?))
    }

    /// Partitions of this disk, discovered on first call. Partitions are not
    /// scanned for nested tables.
    pub fn get_partitions(&mut self) -> Result<&[Disk]> {
        self.ensure_open()?;
        if self.partitions.is_none() {
            let parts = self.discover_partitions()?;
            self.partitions = Some(parts);
        }
        Ok(self.partitions.as_deref().unwrap_or_default())
    }

    /// Mutable access to the discovered partitions, for cursor I/O.
    pub fn partitions_mut(&mut self) -> Result<&mut [Disk]> {
        self.get_partitions()?;
        Ok(self.partitions.as_deref_mut().unwrap_or_default())
    }

    fn discover_partitions(&mut self) -> Result<Vec<Disk>> {
        if self.partition.is_some() {
            self.scheme = Some(PartitionScheme::None);
            return Ok(Vec::new());
        }
        let view = self.view()?;
        let scan = partition::scan_partitions(view.as_ref(), self.block_size)?;
        self.scheme = Some(scan.scheme);
        if scan.scheme == PartitionScheme::Ldm {
            warn!(disk = %self.name, "dynamic (LDM) disk; its volumes are not parsed");
        }
        let mut parts = Vec::with_capacity(scan.entries.len());
        for entry in scan.entries {
            let Some(start) = entry
                .start_lba
                .to_bytes(self.block_size)
                .and_then(|b| b.0.checked_add(self.start_byte))
            else {
                warn!(disk = %self.name, index = entry.index, "partition start overflows; skipped");
                continue;
            };
            let len = entry.length.saturating_mul(self.block_size);
            let mut end = start.saturating_add(len);
            if start >= self.end_byte {
                warn!(
                    disk = %self.name,
                    index = entry.index,
                    start,
                    "partition starts beyond the end of the disk; skipped"
                );
                continue;
            }
            if end > self.end_byte {
                warn!(disk = %self.name, index = entry.index, end, "partition truncated at disk end");
                end = self.end_byte;
            }
            debug!(
                disk = %self.name,
                index = entry.index,
                ptype = entry.kind.type_code(),
                start,
                end,
                "partition discovered"
            );
            parts.push(Disk {
                name: format!("{}p{}", self.name, entry.index),
                backend: Arc::clone(&self.backend),
                owns_backend: false,
                start_byte: start,
                end_byte: end,
                block_size: self.block_size,
                pos: 0,
                partition: Some(entry),
                disk_signature: self.disk_signature,
                hardware_id: self.hardware_id.clone(),
                partitions: None,
                scheme: None,
                closed: false,
            });
        }
        Ok(parts)
    }

    /// Partitioning scheme of this disk (scans on first call).
    pub fn partition_scheme(&mut self) -> Result<PartitionScheme> {
        self.get_partitions()?;
        Ok(self.scheme.unwrap_or(PartitionScheme::None))
    }

    /// True for Windows dynamic disks.
    pub fn is_dynamic_disk(&mut self) -> Result<bool> {
        Ok(self.partition_scheme()? == PartitionScheme::Ldm)
    }

    /// Close discovered partitions and, for the whole disk, the backend.
    /// Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        if let Some(parts) = self.partitions.as_mut() {
            for part in parts {
                if let Err(err) = part.close() {
                    warn!(disk = %part.name, error = %err, "partition close failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        if self.owns_backend {
            debug!(disk = %self.name, "closing disk backend");
            if let Err(err) = self.backend.close() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Serializable description. Partitions are listed only once they have
    /// been discovered.
    #[must_use]
    pub fn summary(&self) -> DiskSummary {
        DiskSummary {
            name: self.name.clone(),
            format: self.backend.kind(),
            size: self.size(),
            start_byte: self.start_byte,
            hardware_id: self.hardware_id.clone(),
            disk_signature: self.disk_signature,
            partition_scheme: self.scheme,
            partition: self.partition.clone(),
            partitions: self
                .partitions
                .iter()
                .flatten()
                .map(Disk::summary)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSummary {
    pub name: String,
    pub format: &'static str,
    pub size: u64,
    pub start_byte: u64,
    pub hardware_id: Option<String>,
    pub disk_signature: Option<u32>,
    pub partition_scheme: Option<PartitionScheme>,
    pub partition: Option<PartitionTableEntry>,
    pub partitions: Vec<DiskSummary>,
}

/// Open the leaf backend for `desc` without any format layers.
fn open_source(desc: &DiskDescriptor, name: &str, mode: AccessMode) -> Result<Arc<dyn DiskBackend>> {
    let leaf: Arc<dyn DiskBackend> = match &desc.source {
        DiskSource::LocalFile(path) | DiskSource::BlockDevice(path) => {
            Arc::new(FileBackend::open(path, mode)?)
        }
        DiskSource::Remote(source) => {
            let remote: Arc<dyn DiskBackend> = Arc::new(RemoteBlobBackend::open(Arc::clone(source))?);
            let cache = desc.cache.clone().unwrap_or_default();
            debug!(disk = name, block_size = cache.block_size, capacity = cache.capacity, "caching remote disk");
            Arc::new(CachedBackend::new(remote, cache)?)
        }
        DiskSource::Backend(backend) => Arc::clone(backend),
    };
    let leaf: Arc<dyn DiskBackend> = match (&desc.source, &desc.cache) {
        (DiskSource::Remote(_), _) | (_, None) => leaf,
        (_, Some(cache)) => Arc::new(CachedBackend::new(leaf, cache.clone())?),
    };
    if desc.offset == 0 {
        return Ok(leaf);
    }
    let Some(len) = leaf.len_bytes().checked_sub(desc.offset) else {
        let total = leaf.len_bytes();
        let _ = leaf.close();
        return Err(VmsError::InvalidConfig(format!(
            "{name}: offset {} is beyond the end of a {total}-byte source",
            desc.offset
        )));
    };
    Ok(Arc::new(WindowBackend::owning(leaf, desc.offset, len)?))
}

/// Open `desc` with its parents and format layers. Parents are always
/// opened read-only.
fn open_chain(
    desc: &DiskDescriptor,
    registry: &FormatRegistry,
    name: &str,
    mode: AccessMode,
    depth: usize,
) -> Result<Arc<dyn DiskBackend>> {
    if depth > MAX_PARENT_DEPTH {
        return Err(VmsError::InvalidConfig(format!(
            "{name}: parent chain deeper than {MAX_PARENT_DEPTH}"
        )));
    }
    let parent = match &desc.parent {
        Some(parent_desc) => {
            let parent_name = parent_desc.display_name();
            debug!(disk = name, parent = %parent_name, "opening parent disk");
            Some(open_chain(
                parent_desc,
                registry,
                &parent_name,
                AccessMode::ReadOnly,
                depth + 1,
            )?)
        }
        None => None,
    };

    let leaf = match open_source(desc, name, mode) {
        Ok(leaf) => leaf,
        Err(err) => {
            if let Some(parent) = parent {
                let _ = parent.close();
            }
            return Err(err);
        }
    };
    if desc.raw {
        return Ok(leaf);
    }

    let mut ctx = FormatContext::new(name, mode);
    ctx.parent = parent;
    let stacked = match registry.stack(leaf, &mut ctx) {
        Ok(stacked) => stacked,
        Err(err) => {
            if let Some(parent) = ctx.parent.take() {
                let _ = parent.close();
            }
            return Err(err);
        }
    };
    if let Some(unused) = ctx.parent.take() {
        warn!(
            disk = name,
            format = stacked.kind(),
            "format has no backing parent; closing the configured parent"
        );
        unused.close()?;
    }

    if !desc.base_only {
        return Ok(stacked);
    }
    let mut top = stacked;
    while let Some(parent) = top.take_parent() {
        debug!(disk = name, leaf = top.kind(), base = parent.kind(), "dropping leaf for its parent");
        top.close()?;
        top = parent;
    }
    Ok(top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    fn mbr_with(entries: &[(u8, u32, u32)], len: usize) -> Vec<u8> {
        let mut image = vec![0_u8; len];
        for (slot, (ptype, start, sectors)) in entries.iter().enumerate() {
            let at = 0x1BE + slot * 16;
            image[at + 4] = *ptype;
            image[at + 8..at + 12].copy_from_slice(&start.to_le_bytes());
            image[at + 12..at + 16].copy_from_slice(&sectors.to_le_bytes());
        }
        image[0x1B8..0x1BC].copy_from_slice(&0xCAFE_F00D_u32.to_le_bytes());
        image[510] = 0x55;
        image[511] = 0xAA;
        image
    }

    fn memory_disk(image: Vec<u8>) -> Disk {
        Disk::from_backend("mem0", Arc::new(MemoryBackend::new(image))).expect("disk")
    }

    #[test]
    fn seek_and_read_follow_the_cursor() {
        let image: Vec<u8> = (0..=255_u8).cycle().take(4096).collect();
        let mut disk = memory_disk(image);
        assert_eq!(disk.seek(10, Whence::Start).expect("seek"), 10);
        assert_eq!(disk.read(4).expect("read"), vec![10, 11, 12, 13]);
        assert_eq!(disk.seek(-2, Whence::Current).expect("seek"), 12);
        assert_eq!(disk.seek(-3, Whence::End).expect("seek"), 4093);
        let tail = disk.read(16).expect("read");
        assert_eq!(tail.len(), 3);
        assert_eq!(disk.position(), 4096);
        assert!(disk.read(1).expect("read at end").is_empty());
        assert!(disk.seek(-1, Whence::Start).is_err());
    }

    #[test]
    fn partitions_are_windows_on_the_same_backend() {
        let image = mbr_with(&[(0x83, 2, 4), (0x00, 0, 0), (0x8E, 6, 2)], 8 * 512);
        let mut disk = memory_disk(image);
        assert_eq!(disk.disk_signature(), Some(0xCAFE_F00D));
        let parts = disk.get_partitions().expect("partitions");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name(), "mem0p1");
        assert_eq!(parts[0].start_byte(), 1024);
        assert_eq!(parts[0].end_byte(), 3072);
        assert_eq!(parts[1].partition_number(), 3);
        assert_eq!(parts[1].partition_type(), 0x8E);
        assert_eq!(disk.partition_scheme().expect("scheme"), PartitionScheme::Mbr);
    }

    #[test]
    fn partition_reads_are_relative_to_its_start() {
        let mut image = mbr_with(&[(0x83, 2, 2)], 4 * 512);
        image[1024..1028].copy_from_slice(b"PART");
        let mut disk = memory_disk(image);
        let part = &mut disk.partitions_mut().expect("partitions")[0];
        assert_eq!(part.read(4).expect("read"), b"PART");
        let mut buf = [0_u8; 8];
        assert_eq!(part.read_at(1020, &mut buf).expect("read_at"), 4);
    }

    #[test]
    fn oversized_partition_is_truncated() {
        let image = mbr_with(&[(0x83, 2, 100), (0x83, 50, 1)], 8 * 512);
        let mut disk = memory_disk(image);
        let parts = disk.get_partitions().expect("partitions");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].end_byte(), 8 * 512);
    }

    #[test]
    fn close_is_idempotent_and_only_the_owner_closes() {
        let backend = Arc::new(MemoryBackend::new(mbr_with(&[(0x83, 1, 1)], 4 * 512)));
        let mut disk = Disk::from_backend("mem0", backend.clone()).expect("disk");
        disk.partitions_mut().expect("partitions")[0]
            .close()
            .expect("close partition");
        assert!(!backend.is_closed());
        disk.close().expect("close");
        disk.close().expect("close again");
        assert!(backend.is_closed());
        assert!(matches!(disk.read(1), Err(VmsError::Closed(_))));
    }

    #[derive(Debug)]
    struct FailingClose(MemoryBackend);

    impl DiskBackend for FailingClose {
        fn kind(&self) -> &'static str {
            "failing"
        }

        fn len_bytes(&self) -> u64 {
            self.0.len_bytes()
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.0.read_exact_at(offset, buf)
        }

        fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            self.0.write_all_at(offset, buf)
        }

        fn is_writable(&self) -> bool {
            false
        }

        fn close(&self) -> Result<()> {
            Err(VmsError::Io(std::io::Error::other("close failed")))
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn failed_partition_close_still_closes_the_rest() {
        let backend = Arc::new(MemoryBackend::new(mbr_with(&[(0x83, 1, 1), (0x83, 2, 1)], 4 * 512)));
        let mut disk = Disk::from_backend("mem0", backend.clone()).expect("disk");
        disk.partitions_mut().expect("partitions")[0] =
            Disk::from_backend("bad", Arc::new(FailingClose(MemoryBackend::zeroed(512))))
                .expect("failing disk");

        let err = disk.close().expect_err("close error is reported");
        assert!(matches!(err, VmsError::Io(_)), "{err:?}");
        let parts = disk.partitions.as_ref().expect("discovered");
        assert!(parts[1].is_closed());
        assert!(backend.is_closed());
        disk.close().expect("second close is a no-op");
    }

    #[test]
    fn write_on_read_only_backend_is_unsupported() {
        let mut disk = Disk::from_backend("ro", Arc::new(MemoryBackend::read_only(vec![0; 512])))
            .expect("disk");
        assert!(matches!(
            disk.write(b"x"),
            Err(VmsError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn view_does_not_close_the_disk() {
        let disk = memory_disk(vec![1; 1024]);
        let view = disk.view().expect("view");
        view.close().expect("close view");
        let mut buf = [0_u8; 2];
        assert_eq!(disk.read_at(0, &mut buf).expect("read"), 2);
        assert_eq!(buf, [1, 1]);
    }

    #[test]
    fn descriptor_offset_skips_leading_bytes() {
        let mut image = vec![0_u8; 2048];
        image[512..516].copy_from_slice(b"DATA");
        let backend: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(image));
        let desc = DiskDescriptor::backend(backend).with_offset(512).with_raw(true);
        let mut disk = Disk::open(&desc, &FormatRegistry::default()).expect("open");
        assert_eq!(disk.size(), 1536);
        assert_eq!(disk.read(4).expect("read"), b"DATA");
    }

    #[test]
    fn offset_beyond_source_is_rejected() {
        let backend: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(512));
        let desc = DiskDescriptor::backend(backend).with_offset(4096);
        assert!(matches!(
            Disk::open(&desc, &FormatRegistry::default()),
            Err(VmsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unused_parent_is_closed() {
        let parent: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(1024));
        let child: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(1024));
        let desc = DiskDescriptor::backend(child)
            .with_parent(DiskDescriptor::backend(Arc::clone(&parent)));
        let mut disk = Disk::open(&desc, &FormatRegistry::default()).expect("open");
        assert!(parent.is_closed());
        assert_eq!(disk.format(), "memory");
        disk.close().expect("close");
    }
}
