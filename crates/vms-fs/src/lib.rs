#![forbid(unsafe_code)]
//! Read-only filesystem readers.
//!
//! Every reader implements [`FileSystem`], the capability surface the mount
//! layer and callers rely on: existence and type checks, directory
//! enumeration, `stat`, symlink targets and byte-level file reads through a
//! [`FsFile`] handle that implements `Read + Seek`.
//!
//! [`probe_filesystem`] runs the probe chain on a volume. A signature or
//! consistency mismatch is "no match", never an error; only transport
//! failures and recognised-but-unsupported formats surface as `Err`.

pub mod ext4;
pub mod ntfs;
mod path;

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use vms_block::DiskBackend;
use vms_error::{Result, VmsError};

pub use ext4::Ext4Fs;
pub use ntfs::NtfsFs;
pub use path::{MAX_SYMLINK_FOLLOWS, join_path, normalize_path, parent_and_name};

/// Per-filesystem cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCacheConfig {
    /// Parsed inodes (ext4) or MFT records (NTFS).
    pub inode_capacity: usize,
    /// Metadata blocks: directory, extent index and indirect blocks.
    pub block_capacity: usize,
}

impl Default for FsCacheConfig {
    fn default() -> Self {
        Self {
            inode_capacity: 50,
            block_capacity: 50,
        }
    }
}

impl FsCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inode_capacity == 0 || self.block_capacity == 0 {
            return Err(VmsError::InvalidConfig(
                "filesystem cache capacities must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    /// POSIX mode bits; synthesised for filesystems without them.
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Inode or MFT record number.
    pub node_id: u64,
}

/// Random-access view of one file's contents.
pub trait FileData: Send + Sync + fmt::Debug {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `buf.len()` bytes at `offset`; returns 0 at end of file.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Open file with a cursor.
#[derive(Debug)]
pub struct FsFile {
    data: Box<dyn FileData>,
    pos: u64,
}

impl FsFile {
    #[must_use]
    pub fn new(data: Box<dyn FileData>) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.data.read_at(offset, buf)
    }

    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len().saturating_sub(self.pos))
            .map_err(|_| VmsError::ResourceExhausted("file too large for memory".to_owned()))?;
        let mut out = vec![0_u8; len];
        let mut done = 0;
        while done < len {
            let n = self.data.read_at(self.pos, &mut out[done..])?;
            if n == 0 {
                break;
            }
            done += n;
            self.pos += n as u64;
        }
        out.truncate(done);
        Ok(out)
    }
}

impl Read for FsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .data
            .read_at(self.pos, buf)
            .map_err(|err| match err {
                VmsError::Io(io) => io,
                other => io::Error::other(other),
            })?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.data.len().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.pos = target;
        Ok(target)
    }
}

/// Operations shared by every filesystem reader and the mount tree.
///
/// Relative paths resolve against the working directory set by
/// [`FileSystem::chdir`]. Intermediate symlinks are followed; `stat`,
/// `is_symlink` and `read_link` look at the final component itself, while
/// `open`, `dir_entries` and the type checks other than `is_symlink`
/// follow it.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// `"ext4"`, `"ntfs"` or `"mount"`.
    fn fs_type(&self) -> &'static str;

    fn volume_name(&self) -> Option<String>;

    /// Filesystem UUID or serial number.
    fn fs_id(&self) -> String;

    fn free_bytes(&self) -> Result<u64>;

    fn pwd(&self) -> String;

    fn chdir(&self, path: &str) -> Result<()>;

    /// Metadata of `path` without following a final symlink.
    fn stat(&self, path: &str) -> Result<FileStat>;

    /// Names in a directory, without `.` and `..`.
    fn dir_entries(&self, path: &str) -> Result<Vec<String>>;

    fn read_link(&self, path: &str) -> Result<String>;

    fn open(&self, path: &str) -> Result<FsFile>;

    /// Metadata of `path` after following a final symlink.
    fn stat_follow(&self, path: &str) -> Result<FileStat>;

    fn exists(&self, path: &str) -> Result<bool> {
        lookup_flag(self.stat(path).map(|_| true))
    }

    fn is_file(&self, path: &str) -> Result<bool> {
        lookup_flag(self.stat_follow(path).map(|s| s.kind == FileKind::File))
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        lookup_flag(self.stat_follow(path).map(|s| s.kind == FileKind::Directory))
    }

    fn is_symlink(&self, path: &str) -> Result<bool> {
        lookup_flag(self.stat(path).map(|s| s.kind == FileKind::Symlink))
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.open(path)?.read_to_vec()
    }
}

/// Lookup failures answer "no" to a yes/no question; anything else is a
/// real error.
fn lookup_flag(result: Result<bool>) -> Result<bool> {
    match result {
        Ok(flag) => Ok(flag),
        Err(VmsError::NotFound(_) | VmsError::NotDirectory(_) | VmsError::SymlinkLoop(_)) => {
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

// ── probe chain ────────────────────────────────────────────────────────────

const AUFS_MAGIC_OFFSET: u64 = 1024 + 52;
const AUFS_SUPER_MAGIC: u32 = 0x1212_1313;

/// Detect and open the filesystem on `volume`.
///
/// Probes run in order ext4 (which also covers ext2 and ext3), AUFS, NTFS.
/// AUFS is recognised only to be refused with `UnsupportedFeature`.
pub fn probe_filesystem(
    name: &str,
    volume: Arc<dyn DiskBackend>,
    cache: &FsCacheConfig,
) -> Result<Option<Arc<dyn FileSystem>>> {
    cache.validate()?;
    if let Some(fs) = Ext4Fs::probe(name, Arc::clone(&volume), cache)? {
        debug!(volume = name, fs_type = "ext4", "filesystem probe matched");
        return Ok(Some(Arc::new(fs)));
    }
    if is_aufs(volume.as_ref())? {
        return Err(VmsError::UnsupportedFeature(format!("AUFS on {name}")));
    }
    if let Some(fs) = NtfsFs::probe(name, volume, cache)? {
        debug!(volume = name, fs_type = "ntfs", "filesystem probe matched");
        return Ok(Some(Arc::new(fs)));
    }
    debug!(volume = name, "no filesystem recognised");
    Ok(None)
}

fn is_aufs(volume: &dyn DiskBackend) -> Result<bool> {
    if volume.len_bytes() < AUFS_MAGIC_OFFSET + 4 {
        return Ok(false);
    }
    let mut buf = [0_u8; 4];
    volume.read_exact_at(AUFS_MAGIC_OFFSET, &mut buf)?;
    Ok(u32::from_le_bytes(buf) == AUFS_SUPER_MAGIC || &buf == b"aufs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    #[test]
    fn default_cache_bounds() {
        let cfg = FsCacheConfig::default();
        assert_eq!((cfg.inode_capacity, cfg.block_capacity), (50, 50));
        assert!(
            FsCacheConfig {
                inode_capacity: 0,
                block_capacity: 1
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn blank_volume_has_no_filesystem() {
        let vol: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(64 * 1024));
        let fs = probe_filesystem("blank", vol, &FsCacheConfig::default()).expect("probe");
        assert!(fs.is_none());
    }

    #[test]
    fn aufs_is_refused() {
        let mut image = vec![0_u8; 8192];
        image[1076..1080].copy_from_slice(&AUFS_SUPER_MAGIC.to_le_bytes());
        let vol: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(image));
        let err = probe_filesystem("aufs", vol, &FsCacheConfig::default()).expect_err("aufs");
        assert!(matches!(err, VmsError::UnsupportedFeature(_)));
    }

    #[derive(Debug)]
    struct Bytes(Vec<u8>);

    impl FileData for Bytes {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.0.len());
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }
    }

    #[test]
    fn fs_file_reads_and_seeks() {
        let mut file = FsFile::new(Box::new(Bytes(b"hello world".to_vec())));
        let mut head = [0_u8; 5];
        file.read_exact(&mut head).expect("read");
        assert_eq!(&head, b"hello");
        assert_eq!(file.seek(SeekFrom::End(-5)).expect("seek"), 6);
        let mut tail = String::new();
        file.read_to_string(&mut tail).expect("tail");
        assert_eq!(tail, "world");
        assert!(file.seek(SeekFrom::Current(-100)).is_err());
    }
}
