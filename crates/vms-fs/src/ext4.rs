//! ext2/ext3/ext4 reader.
//!
//! Inodes and metadata blocks (group descriptors, directory blocks, extent
//! index and indirect blocks) go through bounded LRU caches; file data is
//! read straight from the volume.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vms_block::{DiskBackend, LruCache};
use vms_error::{Result, VmsError};
use vms_ondisk::ext4::{
    EXT4_DIND_BLOCK, EXT4_IND_BLOCK, EXT4_MAX_EXTENT_DEPTH, EXT4_NDIR_BLOCKS, EXT4_TIND_BLOCK,
    Ext4DirEntry, Ext4Extent, Ext4GroupDesc, Ext4IncompatFeatures, Ext4Inode, Ext4Superblock,
    ExtentTree, S_IFDIR, S_IFLNK, S_IFREG, parse_dir_block, parse_extent_tree,
    verify_inode_checksum,
};
use vms_types::{
    EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE, InodeNumber, ParseError, parse_error_to_vms,
};

use crate::path::{self, Namespace};
use crate::{FileData, FileKind, FileStat, FileSystem, FsCacheConfig, FsFile};

#[derive(Debug)]
pub struct Ext4Fs {
    inner: Arc<Ext4Inner>,
    cwd: Mutex<String>,
}

#[derive(Debug)]
struct Ext4Inner {
    name: String,
    dev: Arc<dyn DiskBackend>,
    sb: Ext4Superblock,
    inodes: Mutex<LruCache<u64, Arc<Ext4Inode>>>,
    blocks: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
}

#[derive(Debug, Clone)]
struct Ext4Node {
    ino: u64,
    inode: Arc<Ext4Inode>,
}

/// How an inode's logical blocks map to physical blocks.
#[derive(Debug, Clone)]
enum BlockMap {
    /// Flattened leaf extents, sorted by logical block.
    Extents(Vec<Ext4Extent>),
    /// Direct, single, double and triple indirect pointers.
    Indirect([u32; 15]),
}

impl Ext4Fs {
    /// Open `dev` as ext2/3/4, returning `None` when it is not one.
    ///
    /// Transport failures propagate; anything the superblock or root inode
    /// rejects is a non-match.
    pub fn probe(
        name: &str,
        dev: Arc<dyn DiskBackend>,
        cache: &FsCacheConfig,
    ) -> Result<Option<Self>> {
        match Self::open(name, dev, cache) {
            Ok(fs) => Ok(Some(fs)),
            Err(err @ (VmsError::Io(_) | VmsError::Closed(_) | VmsError::InvalidConfig(_))) => {
                Err(err)
            }
            Err(err) => {
                debug!(volume = name, error = %err, "ext4 probe rejected volume");
                Ok(None)
            }
        }
    }

    pub fn open(name: &str, dev: Arc<dyn DiskBackend>, cache: &FsCacheConfig) -> Result<Self> {
        let min_len = (EXT4_SUPERBLOCK_OFFSET + EXT4_SUPERBLOCK_SIZE) as u64;
        if dev.len_bytes() < min_len {
            return Err(VmsError::Format(format!(
                "{name}: volume too small for an ext4 superblock"
            )));
        }
        let mut region = vec![0_u8; EXT4_SUPERBLOCK_SIZE];
        dev.read_exact_at(EXT4_SUPERBLOCK_OFFSET as u64, &mut region)?;
        let sb = Ext4Superblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_to_vms("ext4 superblock", &e))?;
        sb.validate()
            .map_err(|e| parse_error_to_vms("ext4 superblock", &e))?;
        if sb
            .feature_incompat
            .contains(Ext4IncompatFeatures::JOURNAL_DEV)
        {
            return Err(VmsError::Format(format!(
                "{name}: external journal device, not a filesystem"
            )));
        }
        if !sb.checksum_matches(&region) {
            warn!(volume = name, "ext4 superblock checksum mismatch");
        }
        if sb.has_errors() {
            warn!(volume = name, "ext4 filesystem was left with errors");
        }
        if sb.orphans_recovering() {
            warn!(volume = name, "ext4 orphan inodes are being recovered");
        }

        let inner = Arc::new(Ext4Inner {
            name: name.to_owned(),
            dev,
            inodes: Mutex::new(LruCache::new(cache.inode_capacity)?),
            blocks: Mutex::new(LruCache::new(cache.block_capacity)?),
            sb,
        });
        let root = inner.root()?;
        if !root.inode.is_dir() {
            return Err(VmsError::corruption(
                format!("{name} root inode"),
                "not a directory",
            ));
        }
        info!(
            volume = name,
            uuid = %inner.sb.uuid_string(),
            block_size = inner.sb.block_size,
            blocks = inner.sb.blocks_count,
            incompat = ?inner.sb.feature_incompat.describe(),
            "opened ext4 filesystem"
        );
        Ok(Self {
            inner,
            cwd: Mutex::new("/".to_owned()),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext4Superblock {
        &self.inner.sb
    }

    /// `(hits, misses)` of the inode cache.
    #[must_use]
    pub fn inode_cache_stats(&self) -> (u64, u64) {
        self.inner.inodes.lock().stats()
    }

    fn resolve(&self, path: &str, follow_final: bool) -> Result<path::Resolved<Ext4Node>> {
        let cwd = self.cwd.lock().clone();
        path::resolve(self.inner.as_ref(), &cwd, path, follow_final)
    }
}

// ── metadata access ────────────────────────────────────────────────────────

impl Ext4Inner {
    fn block_size(&self) -> u64 {
        u64::from(self.sb.block_size)
    }

    fn parse_err(&self, what: &str, err: &ParseError) -> VmsError {
        parse_error_to_vms(format!("{} {what}", self.name), err)
    }

    fn block_address(&self, block: u64) -> Result<u64> {
        if block >= self.sb.blocks_count {
            return Err(VmsError::corruption(
                format!("{} block map", self.name),
                format!("block {block} beyond block count {}", self.sb.blocks_count),
            ));
        }
        self.sb.block_to_address(block).ok_or_else(|| {
            VmsError::corruption(format!("{} block map", self.name), "block address overflow")
        })
    }

    /// Metadata block through the block cache.
    fn read_block(&self, block: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.blocks.lock().get_cloned(&block) {
            return Ok(hit);
        }
        let address = self.block_address(block)?;
        let mut buf = vec![0_u8; self.sb.block_size as usize];
        self.dev.read_exact_at(address, &mut buf)?;
        let buf = Arc::new(buf);
        self.blocks.lock().insert(block, Arc::clone(&buf));
        Ok(buf)
    }

    fn read_group_desc(&self, group: u32) -> Result<Ext4GroupDesc> {
        if group >= self.sb.groups_count() {
            return Err(VmsError::corruption(
                format!("{} group descriptors", self.name),
                format!("group {group} out of range"),
            ));
        }
        let address = self
            .sb
            .group_desc_address(vms_types::GroupNumber(group))
            .ok_or_else(|| {
                VmsError::corruption(format!("{} group descriptors", self.name), "overflow")
            })?;
        let bs = self.block_size();
        let block = self.read_block(address / bs)?;
        let start = (address % bs) as usize;
        Ext4GroupDesc::parse_from_bytes(&block[start..], self.sb.group_desc_size())
            .map_err(|e| self.parse_err("group descriptor", &e))
    }

    fn read_inode(&self, ino: u64) -> Result<Arc<Ext4Inode>> {
        if ino == 0 || ino > u64::from(self.sb.inodes_count) {
            return Err(VmsError::corruption(
                format!("{} inode table", self.name),
                format!("inode {ino} out of range"),
            ));
        }
        if let Some(hit) = self.inodes.lock().get_cloned(&ino) {
            return Ok(hit);
        }
        let (group, offset) = self.sb.inode_location(InodeNumber(ino));
        let desc = self.read_group_desc(group.0)?;
        let address = self
            .block_address(desc.inode_table)?
            .checked_add(offset)
            .ok_or_else(|| {
                VmsError::corruption(format!("{} inode table", self.name), "address overflow")
            })?;
        let inode_size = self.sb.inode_size();
        let mut raw = vec![0_u8; usize::from(inode_size)];
        self.dev.read_exact_at(address, &mut raw)?;
        if self.sb.has_metadata_csum() {
            let ino32 = u32::try_from(ino).unwrap_or(u32::MAX);
            if let Err(err) = verify_inode_checksum(&raw, self.sb.csum_seed(), ino32, inode_size)
            {
                warn!(volume = %self.name, ino, error = %err, "inode checksum mismatch");
            }
        }
        let inode =
            Arc::new(Ext4Inode::parse_from_bytes(&raw).map_err(|e| self.parse_err("inode", &e))?);
        self.inodes.lock().insert(ino, Arc::clone(&inode));
        Ok(inode)
    }

    fn node(&self, ino: u64) -> Result<Ext4Node> {
        Ok(Ext4Node {
            ino,
            inode: self.read_inode(ino)?,
        })
    }

    // ── block mapping ──────────────────────────────────────────────────

    fn block_map(&self, inode: &Ext4Inode) -> Result<BlockMap> {
        if inode.has_inline_data() {
            return Err(VmsError::UnsupportedFeature(format!(
                "{}: inline data",
                self.name
            )));
        }
        if inode.uses_extents() {
            let (header, tree) =
                parse_extent_tree(&inode.block_area).map_err(|e| self.parse_err("extent root", &e))?;
            let mut extents = Vec::new();
            self.collect_extents(&tree, header.depth, &mut extents)?;
            extents.sort_by_key(|e| e.logical_block);
            Ok(BlockMap::Extents(extents))
        } else {
            Ok(BlockMap::Indirect(inode.block_pointers()))
        }
    }

    fn collect_extents(
        &self,
        tree: &ExtentTree,
        remaining_depth: u16,
        out: &mut Vec<Ext4Extent>,
    ) -> Result<()> {
        if remaining_depth > EXT4_MAX_EXTENT_DEPTH {
            return Err(VmsError::corruption(
                format!("{} extent tree", self.name),
                "depth exceeds maximum",
            ));
        }
        match tree {
            ExtentTree::Leaf(extents) => {
                out.extend_from_slice(extents);
                Ok(())
            }
            ExtentTree::Index(indexes) => {
                if remaining_depth == 0 {
                    return Err(VmsError::corruption(
                        format!("{} extent tree", self.name),
                        "index node at depth 0",
                    ));
                }
                for idx in indexes {
                    let child = self.read_block(idx.leaf_block)?;
                    let (child_header, child_tree) = parse_extent_tree(&child)
                        .map_err(|e| self.parse_err("extent node", &e))?;
                    if child_header.depth + 1 != remaining_depth {
                        return Err(VmsError::corruption(
                            format!("{} extent tree", self.name),
                            format!("depth inconsistency below block {}", idx.leaf_block),
                        ));
                    }
                    self.collect_extents(&child_tree, remaining_depth - 1, out)?;
                }
                Ok(())
            }
        }
    }

    /// Physical block of `lblock`, or `None` for a hole.
    fn map_block(&self, map: &BlockMap, lblock: u64) -> Result<Option<u64>> {
        match map {
            BlockMap::Extents(extents) => {
                let Ok(lblock) = u32::try_from(lblock) else {
                    return Ok(None);
                };
                let idx = extents.partition_point(|e| e.logical_block <= lblock);
                let Some(ext) = idx.checked_sub(1).map(|i| extents[i]) else {
                    return Ok(None);
                };
                if !ext.contains(lblock) || ext.is_unwritten() {
                    return Ok(None);
                }
                Ok(Some(ext.physical_start + u64::from(lblock - ext.logical_block)))
            }
            BlockMap::Indirect(ptrs) => self.map_indirect(ptrs, lblock),
        }
    }

    fn map_indirect(&self, ptrs: &[u32; 15], lblock: u64) -> Result<Option<u64>> {
        let per = self.block_size() / 4;
        let direct = EXT4_NDIR_BLOCKS as u64;
        let (start, path): (u32, Vec<u64>) = if lblock < direct {
            (ptrs[lblock as usize], Vec::new())
        } else {
            let l = lblock - direct;
            if l < per {
                (ptrs[EXT4_IND_BLOCK], vec![l])
            } else if l - per < per * per {
                let l = l - per;
                (ptrs[EXT4_DIND_BLOCK], vec![l / per, l % per])
            } else if l - per - per * per < per * per * per {
                let l = l - per - per * per;
                (
                    ptrs[EXT4_TIND_BLOCK],
                    vec![l / (per * per), (l / per) % per, l % per],
                )
            } else {
                return Ok(None);
            }
        };
        let mut current = start;
        for slot in path {
            if current == 0 {
                return Ok(None);
            }
            let block = self.read_block(u64::from(current))?;
            let at = (slot * 4) as usize;
            current = u32::from_le_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]]);
        }
        Ok((current != 0).then_some(u64::from(current)))
    }

    /// Copy up to `buf.len()` bytes of file data at `offset`. Holes and
    /// unwritten extents read as zeros.
    fn read_data(&self, map: &BlockMap, size: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= size {
            return Ok(0);
        }
        let to_read = usize::try_from((size - offset).min(buf.len() as u64)).unwrap_or(buf.len());
        let bs = self.block_size();
        let mut done = 0_usize;
        while done < to_read {
            let pos = offset + done as u64;
            let lblock = pos / bs;
            let within = pos % bs;
            let chunk = ((bs - within) as usize).min(to_read - done);
            let out = &mut buf[done..done + chunk];
            match self.map_block(map, lblock)? {
                Some(phys) => {
                    let address = self.block_address(phys)? + within;
                    self.dev.read_exact_at(address, out)?;
                }
                None => out.fill(0),
            }
            done += chunk;
        }
        Ok(done)
    }

    fn read_dir(&self, node: &Ext4Node) -> Result<Vec<Ext4DirEntry>> {
        if !node.inode.is_dir() {
            return Err(VmsError::NotDirectory(format!("inode {}", node.ino)));
        }
        let map = self.block_map(&node.inode)?;
        let nblocks = node.inode.size.div_ceil(self.block_size());
        let mut entries = Vec::new();
        for lblock in 0..nblocks {
            if let Some(phys) = self.map_block(&map, lblock)? {
                let block = self.read_block(phys)?;
                entries.extend(
                    parse_dir_block(&block, self.sb.block_size)
                        .map_err(|e| self.parse_err("directory block", &e))?,
                );
            }
        }
        Ok(entries)
    }

    fn read_symlink(&self, node: &Ext4Node) -> Result<String> {
        if !node.inode.is_symlink() {
            return Err(VmsError::NotSymlink(format!("inode {}", node.ino)));
        }
        let mut target = if let Some(inline) = node.inode.fast_symlink_target() {
            inline.to_vec()
        } else {
            let len = usize::try_from(node.inode.size).map_err(|_| {
                VmsError::corruption(format!("{} symlink", self.name), "size overflow")
            })?;
            let mut buf = vec![0_u8; len];
            let map = self.block_map(&node.inode)?;
            let n = self.read_data(&map, node.inode.size, 0, &mut buf)?;
            buf.truncate(n);
            buf
        };
        if let Some(pos) = target.iter().position(|b| *b == 0) {
            target.truncate(pos);
        }
        Ok(String::from_utf8_lossy(&target).into_owned())
    }
}

impl Namespace for Ext4Inner {
    type Node = Ext4Node;

    fn root(&self) -> Result<Ext4Node> {
        self.node(InodeNumber::ROOT.0)
    }

    fn lookup(&self, dir: &Ext4Node, name: &str) -> Result<Option<Ext4Node>> {
        let found = self
            .read_dir(dir)?
            .into_iter()
            .find(|entry| entry.name == name.as_bytes());
        found.map(|entry| self.node(u64::from(entry.inode))).transpose()
    }

    fn is_dir(&self, node: &Ext4Node) -> Result<bool> {
        Ok(node.inode.is_dir())
    }

    fn symlink_target(&self, node: &Ext4Node) -> Result<Option<String>> {
        if node.inode.is_symlink() {
            self.read_symlink(node).map(Some)
        } else {
            Ok(None)
        }
    }
}

fn inode_stat(node: &Ext4Node) -> FileStat {
    let inode = &node.inode;
    let kind = match inode.file_type_mode() {
        S_IFREG => FileKind::File,
        S_IFDIR => FileKind::Directory,
        S_IFLNK => FileKind::Symlink,
        _ => FileKind::Other,
    };
    FileStat {
        kind,
        size: inode.size,
        mode: u32::from(inode.mode),
        atime: inode.atime_secs(),
        mtime: inode.mtime_secs(),
        ctime: inode.ctime_secs(),
        node_id: node.ino,
    }
}

#[derive(Debug)]
struct Ext4FileData {
    fs: Arc<Ext4Inner>,
    size: u64,
    map: BlockMap,
}

impl FileData for Ext4FileData {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.fs.read_data(&self.map, self.size, offset, buf)
    }
}

impl FileSystem for Ext4Fs {
    fn fs_type(&self) -> &'static str {
        "ext4"
    }

    fn volume_name(&self) -> Option<String> {
        let label = &self.inner.sb.volume_name;
        (!label.is_empty()).then(|| label.clone())
    }

    fn fs_id(&self) -> String {
        self.inner.sb.uuid_string()
    }

    fn free_bytes(&self) -> Result<u64> {
        Ok(self.inner.sb.free_bytes())
    }

    fn pwd(&self) -> String {
        self.cwd.lock().clone()
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path, true)?;
        if !resolved.node.inode.is_dir() {
            return Err(VmsError::NotDirectory(resolved.path));
        }
        *self.cwd.lock() = resolved.path;
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        Ok(inode_stat(&self.resolve(path, false)?.node))
    }

    fn stat_follow(&self, path: &str) -> Result<FileStat> {
        Ok(inode_stat(&self.resolve(path, true)?.node))
    }

    fn dir_entries(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(path, true)?;
        if !resolved.node.inode.is_dir() {
            return Err(VmsError::NotDirectory(resolved.path));
        }
        Ok(self
            .inner
            .read_dir(&resolved.node)?
            .iter()
            .filter(|entry| !entry.is_dot_or_dotdot())
            .map(Ext4DirEntry::name_str)
            .collect())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path, false)?;
        if !resolved.node.inode.is_symlink() {
            return Err(VmsError::NotSymlink(resolved.path));
        }
        self.inner.read_symlink(&resolved.node)
    }

    fn open(&self, path: &str) -> Result<FsFile> {
        let resolved = self.resolve(path, true)?;
        let inode = &resolved.node.inode;
        if inode.is_dir() {
            return Err(VmsError::IsDirectory(resolved.path));
        }
        if !inode.is_regular() {
            return Err(VmsError::unsupported_op("open", resolved.path));
        }
        let map = self.inner.block_map(inode)?;
        debug!(volume = %self.inner.name, path = %resolved.path, size = inode.size, "open");
        Ok(FsFile::new(Box::new(Ext4FileData {
            fs: Arc::clone(&self.inner),
            size: inode.size,
            map,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;
    use vms_harness::ext4::Ext4Builder;

    fn open(image: Vec<u8>) -> Ext4Fs {
        Ext4Fs::open("test", Arc::new(MemoryBackend::new(image)), &FsCacheConfig::default())
            .expect("open ext4")
    }

    #[test]
    fn unwritten_extent_is_a_hole() {
        let fs = open(
            Ext4Builder::new()
                .sparse_file("/f", 3 * 4096, &[(0, &b"head"[..])], &[(1, 1)])
                .build(),
        );
        let data = fs.read_file("/f").expect("read");
        assert_eq!(&data[..4], b"head");
        assert!(data[4096..].iter().all(|b| *b == 0));
    }

    #[test]
    fn indirect_mapping_reaches_double_indirect() {
        // 1 KiB blocks: 12 direct + 256 single indirect, so 300 blocks
        // spill into the double indirect tree.
        let data: Vec<u8> = (0..300 * 1024).map(|i| (i / 1024) as u8).collect();
        let fs = open(Ext4Builder::ext2().file("/big", &data).build());
        let mut file = fs.open("/big").expect("open");
        let mut buf = [0_u8; 4];
        file.read_at(290 * 1024, &mut buf).expect("read");
        assert_eq!(buf, [34; 4]);
        assert_eq!(file.read_to_vec().expect("all"), data);
    }

    #[test]
    fn inode_cache_is_reused() {
        let fs = open(Ext4Builder::new().file("/etc/hosts", b"127.0.0.1\n").build());
        fs.stat("/etc/hosts").expect("stat");
        fs.stat("/etc/hosts").expect("stat again");
        let (hits, _) = fs.inode_cache_stats();
        assert!(hits > 0);
    }
}
