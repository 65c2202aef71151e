//! Single-group ext2/ext4 volumes.
//!
//! Layout (in blocks, `f` = first data block, 1 for 1 KiB blocks and 0
//! otherwise): superblock in block `f` at byte 1024, group descriptor table
//! in `f + 1`, block bitmap, inode bitmap, then a 128-entry inode table of
//! 256-byte inodes. File and directory data follow in allocation order.

use std::collections::BTreeMap;

use crate::{pattern, place, put_le};

pub const ROOT_INO: u32 = 2;
pub const INODE_SIZE: usize = 256;
pub const INODES: u32 = 128;
const FIRST_USER_INO: u32 = 12;
const EXTRA_ISIZE: u64 = 32;
const EXTENTS_FL: u64 = 0x8_0000;
const EXTENT_MAGIC: u64 = 0xF30A;
const UNWRITTEN_BIAS: u16 = 1 << 15;
pub const DEFAULT_TIME: u32 = 1_700_000_000;

const FT_REG: u8 = 1;
const FT_DIR: u8 = 2;
const FT_SYMLINK: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Extents,
    ExtentIndex,
    Indirect,
}

#[derive(Debug, Clone)]
enum Content {
    Dir,
    File {
        size: u64,
        /// `(logical block, bytes)`; everything else is a hole.
        chunks: Vec<(u32, Vec<u8>)>,
        /// `(logical block, count)` preallocated, never written.
        unwritten: Vec<(u32, u16)>,
        layout: Layout,
    },
    Symlink(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: u32,
    content: Content,
}

#[derive(Debug, Clone)]
pub struct Ext4Builder {
    block_size: usize,
    extents: bool,
    metadata_csum: bool,
    state: u16,
    label: String,
    uuid: [u8; 16],
    nodes: BTreeMap<u32, Node>,
    children: BTreeMap<u32, Vec<(String, u32)>>,
    paths: BTreeMap<String, u32>,
    next_ino: u32,
}

impl Default for Ext4Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ext4Builder {
    /// 4 KiB blocks, extents, clean state.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                parent: ROOT_INO,
                content: Content::Dir,
            },
        );
        let mut paths = BTreeMap::new();
        paths.insert("/".to_owned(), ROOT_INO);
        Self {
            block_size: 4096,
            extents: true,
            metadata_csum: false,
            state: 1,
            label: String::new(),
            uuid: [0x5A; 16],
            nodes,
            children: BTreeMap::new(),
            paths,
            next_ino: FIRST_USER_INO,
        }
    }

    /// ext2-style volume: 1 KiB blocks and indirect block maps throughout.
    #[must_use]
    pub fn ext2() -> Self {
        let mut builder = Self::new();
        builder.block_size = 1024;
        builder.extents = false;
        builder
    }

    #[must_use]
    pub fn block_size(mut self, block_size: usize) -> Self {
        assert!([1024, 2048, 4096].contains(&block_size));
        self.block_size = block_size;
        self
    }

    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_owned();
        self
    }

    #[must_use]
    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    /// Raw `s_state`.
    #[must_use]
    pub fn state(mut self, state: u16) -> Self {
        self.state = state;
        self
    }

    /// Enable `metadata_csum` and write superblock and inode checksums.
    #[must_use]
    pub fn metadata_csum(mut self) -> Self {
        self.metadata_csum = true;
        self
    }

    #[must_use]
    pub fn dir(mut self, path: &str) -> Self {
        self.ensure_dir(path);
        self
    }

    #[must_use]
    pub fn file(self, path: &str, data: &[u8]) -> Self {
        let layout = if self.extents {
            Layout::Extents
        } else {
            Layout::Indirect
        };
        self.add_file(path, data.len() as u64, vec![(0, data.to_vec())], Vec::new(), layout)
    }

    /// File whose extents hang off a one-level index node.
    #[must_use]
    pub fn indexed_file(self, path: &str, data: &[u8]) -> Self {
        assert!(self.extents);
        self.add_file(path, data.len() as u64, vec![(0, data.to_vec())], Vec::new(), Layout::ExtentIndex)
    }

    /// File of `size` bytes with data only at the given logical blocks and
    /// uninitialised extents at `unwritten`.
    #[must_use]
    pub fn sparse_file(
        self,
        path: &str,
        size: u64,
        chunks: &[(u32, &[u8])],
        unwritten: &[(u32, u16)],
    ) -> Self {
        assert!(self.extents);
        let chunks = chunks.iter().map(|(lb, d)| (*lb, d.to_vec())).collect();
        self.add_file(path, size, chunks, unwritten.to_vec(), Layout::Extents)
    }

    #[must_use]
    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.insert(path, Content::Symlink(target.to_owned()));
        self
    }

    /// Inode number assigned to `path`.
    #[must_use]
    pub fn ino(&self, path: &str) -> Option<u32> {
        self.paths.get(path).copied()
    }

    fn add_file(
        mut self,
        path: &str,
        size: u64,
        chunks: Vec<(u32, Vec<u8>)>,
        unwritten: Vec<(u32, u16)>,
        layout: Layout,
    ) -> Self {
        self.insert(
            path,
            Content::File {
                size,
                chunks,
                unwritten,
                layout,
            },
        );
        self
    }

    fn split(path: &str) -> (String, String) {
        let trimmed = path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(0) => ("/".to_owned(), trimmed[1..].to_owned()),
            Some(i) => (trimmed[..i].to_owned(), trimmed[i + 1..].to_owned()),
            None => ("/".to_owned(), trimmed.to_owned()),
        }
    }

    fn ensure_dir(&mut self, path: &str) -> u32 {
        if let Some(ino) = self.paths.get(path.trim_end_matches('/')).copied() {
            return ino;
        }
        if path.trim_end_matches('/').is_empty() {
            return ROOT_INO;
        }
        self.insert(path, Content::Dir)
    }

    fn insert(&mut self, path: &str, content: Content) -> u32 {
        let (parent_path, name) = Self::split(path);
        let parent = self.ensure_dir(&parent_path);
        let ino = self.next_ino;
        assert!(ino <= INODES, "inode table full");
        self.next_ino += 1;
        self.nodes.insert(ino, Node { parent, content });
        self.children.entry(parent).or_default().push((name, ino));
        self.paths.insert(path.trim_end_matches('/').to_owned(), ino);
        ino
    }

    fn first_data_block(&self) -> usize {
        usize::from(self.block_size == 1024)
    }

    fn inode_table_block(&self) -> usize {
        self.first_data_block() + 4
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size;
        let itable = self.inode_table_block();
        let itable_blocks = INODES as usize * INODE_SIZE / bs;
        let data_start = itable + itable_blocks;
        let mut image = vec![0_u8; data_start * bs];
        let mut alloc = Allocator {
            bs,
            next: data_start as u64,
        };

        let mut inodes = Vec::new();
        for (&ino, node) in &self.nodes {
            let mut raw = vec![0_u8; INODE_SIZE];
            let (mode, links, ft_size, flags, i_block, blocks) = match &node.content {
                Content::Dir => {
                    let data = self.dir_block_bytes(ino, node.parent);
                    let subdirs = self.children.get(&ino).map_or(0, |c| {
                        c.iter()
                            .filter(|(_, child)| matches!(self.nodes[child].content, Content::Dir))
                            .count()
                    });
                    let len = data.len() as u64;
                    let layout = if self.extents {
                        Layout::Extents
                    } else {
                        Layout::Indirect
                    };
                    let (flags, i_block, blocks) =
                        self.map_chunks(&mut image, &mut alloc, &[(0, data)], &[], layout);
                    (0o040_755_u16, 2 + subdirs as u16, len, flags, i_block, blocks)
                }
                Content::File {
                    size,
                    chunks,
                    unwritten,
                    layout,
                } => {
                    let (flags, i_block, blocks) =
                        self.map_chunks(&mut image, &mut alloc, chunks, unwritten, *layout);
                    (0o100_644, 1, *size, flags, i_block, blocks)
                }
                Content::Symlink(target) => {
                    if target.len() < 60 {
                        let mut i_block = [0_u8; 60];
                        i_block[..target.len()].copy_from_slice(target.as_bytes());
                        (0o120_777, 1, target.len() as u64, 0, i_block, 0)
                    } else {
                        let layout = if self.extents {
                            Layout::Extents
                        } else {
                            Layout::Indirect
                        };
                        let (flags, i_block, blocks) = self.map_chunks(
                            &mut image,
                            &mut alloc,
                            &[(0, target.as_bytes().to_vec())],
                            &[],
                            layout,
                        );
                        (0o120_777, 1, target.len() as u64, flags, i_block, blocks)
                    }
                }
            };
            put_le(&mut raw, 0x00, u64::from(mode), 2);
            put_le(&mut raw, 0x04, ft_size & 0xFFFF_FFFF, 4);
            put_le(&mut raw, 0x6C, ft_size >> 32, 4);
            put_le(&mut raw, 0x08, u64::from(DEFAULT_TIME), 4);
            put_le(&mut raw, 0x0C, u64::from(DEFAULT_TIME + 1), 4);
            put_le(&mut raw, 0x10, u64::from(DEFAULT_TIME + 2), 4);
            put_le(&mut raw, 0x1A, u64::from(links), 2);
            put_le(&mut raw, 0x1C, blocks * (bs as u64 / 512), 4);
            put_le(&mut raw, 0x20, flags, 4);
            raw[0x28..0x28 + 60].copy_from_slice(&i_block);
            put_le(&mut raw, 0x64, u64::from(ino), 4);
            put_le(&mut raw, 0x80, EXTRA_ISIZE, 2);
            inodes.push((ino, raw));
        }

        let blocks_count = alloc.next.max(64);
        if image.len() < blocks_count as usize * bs {
            image.resize(blocks_count as usize * bs, 0);
        }
        let used_blocks = alloc.next;

        let seed = crc32c::crc32c_append(!0, &self.uuid);
        for (ino, mut raw) in inodes {
            if self.metadata_csum {
                let csum = inode_csum(&raw, seed, ino);
                put_le(&mut raw, 0x7C, u64::from(csum & 0xFFFF), 2);
                put_le(&mut raw, 0x82, u64::from(csum >> 16), 2);
            }
            let at = itable * bs + (ino as usize - 1) * INODE_SIZE;
            image[at..at + INODE_SIZE].copy_from_slice(&raw);
        }

        // bitmaps
        let bb = (self.first_data_block() + 2) * bs;
        for block in self.first_data_block() as u64..used_blocks {
            let bit = (block - self.first_data_block() as u64) as usize;
            image[bb + bit / 8] |= 1 << (bit % 8);
        }
        let ib = (self.first_data_block() + 3) * bs;
        for ino in 1..self.next_ino {
            let bit = (ino - 1) as usize;
            image[ib + bit / 8] |= 1 << (bit % 8);
        }

        let free_blocks = blocks_count - used_blocks;
        let dirs = self
            .nodes
            .values()
            .filter(|n| matches!(n.content, Content::Dir))
            .count() as u64;
        let gd = (self.first_data_block() + 1) * bs;
        put_le(&mut image, gd, (self.first_data_block() + 2) as u64, 4);
        put_le(&mut image, gd + 0x04, (self.first_data_block() + 3) as u64, 4);
        put_le(&mut image, gd + 0x08, itable as u64, 4);
        put_le(&mut image, gd + 0x0C, free_blocks, 2);
        put_le(&mut image, gd + 0x0E, u64::from(INODES + 1 - self.next_ino), 2);
        put_le(&mut image, gd + 0x10, dirs, 2);

        let mut sb = vec![0_u8; 1024];
        put_le(&mut sb, 0x00, u64::from(INODES), 4);
        put_le(&mut sb, 0x04, blocks_count, 4);
        put_le(&mut sb, 0x0C, free_blocks, 4);
        put_le(&mut sb, 0x10, u64::from(INODES + 1 - self.next_ino), 4);
        put_le(&mut sb, 0x14, self.first_data_block() as u64, 4);
        put_le(&mut sb, 0x18, u64::from(bs.trailing_zeros() - 10), 4);
        put_le(&mut sb, 0x20, (bs * 8) as u64, 4);
        put_le(&mut sb, 0x28, u64::from(INODES), 4);
        put_le(&mut sb, 0x2C, u64::from(DEFAULT_TIME), 4);
        put_le(&mut sb, 0x30, u64::from(DEFAULT_TIME), 4);
        put_le(&mut sb, 0x38, 0xEF53, 2);
        put_le(&mut sb, 0x3A, u64::from(self.state), 2);
        put_le(&mut sb, 0x3C, 1, 2);
        put_le(&mut sb, 0x4C, 1, 4);
        put_le(&mut sb, 0x54, 11, 4);
        put_le(&mut sb, 0x58, INODE_SIZE as u64, 2);
        let incompat = if self.extents { 0x0042 } else { 0x0002 };
        put_le(&mut sb, 0x60, incompat, 4);
        if self.metadata_csum {
            put_le(&mut sb, 0x64, 0x0400, 4);
        }
        sb[0x68..0x78].copy_from_slice(&self.uuid);
        let label = self.label.as_bytes();
        sb[0x78..0x78 + label.len().min(16)].copy_from_slice(&label[..label.len().min(16)]);
        if self.metadata_csum {
            let csum = crc32c::crc32c_append(!0, &sb[..0x3FC]);
            put_le(&mut sb, 0x3FC, u64::from(csum), 4);
        }
        place(&mut image, 1024, &sb);
        image
    }

    fn dir_block_bytes(&self, ino: u32, parent: u32) -> Vec<u8> {
        let mut entries = vec![(ino, FT_DIR, b".".to_vec()), (parent, FT_DIR, b"..".to_vec())];
        for (name, child) in self.children.get(&ino).into_iter().flatten() {
            let ft = match self.nodes[child].content {
                Content::Dir => FT_DIR,
                Content::File { .. } => FT_REG,
                Content::Symlink(_) => FT_SYMLINK,
            };
            entries.push((*child, ft, name.as_bytes().to_vec()));
        }
        dir_blocks(&entries, self.block_size)
    }

    /// Allocate and map `chunks`; returns `(i_flags, i_block, data blocks)`.
    fn map_chunks(
        &self,
        image: &mut Vec<u8>,
        alloc: &mut Allocator,
        chunks: &[(u32, Vec<u8>)],
        unwritten: &[(u32, u16)],
        layout: Layout,
    ) -> (u64, [u8; 60], u64) {
        let bs = self.block_size;
        match layout {
            Layout::Indirect => {
                let data = chunks.first().map(|(_, d)| d.clone()).unwrap_or_default();
                let n = data.len().div_ceil(bs);
                let start = alloc.write(image, &data);
                let physical: Vec<u64> = (0..n as u64).map(|i| start + i).collect();
                let (ptrs, meta) = indirect_pointers(image, alloc, &physical);
                let mut i_block = [0_u8; 60];
                for (i, p) in ptrs.iter().enumerate() {
                    put_le(&mut i_block, i * 4, u64::from(*p), 4);
                }
                (0, i_block, n as u64 + meta)
            }
            Layout::Extents | Layout::ExtentIndex => {
                let mut extents = Vec::new();
                let mut total = 0_u64;
                for (lblock, data) in chunks {
                    let n = data.len().div_ceil(bs).max(1);
                    let start = alloc.write(image, data);
                    extents.push((*lblock, n as u16, start));
                    total += n as u64;
                }
                for (lblock, count) in unwritten {
                    let filler = pattern(0xEE, usize::from(*count) * bs);
                    let start = alloc.write(image, &filler);
                    extents.push((*lblock, count + UNWRITTEN_BIAS, start));
                    total += u64::from(*count);
                }
                extents.sort_by_key(|e| e.0);
                let mut i_block = [0_u8; 60];
                if layout == Layout::Extents && extents.len() <= 4 {
                    write_extent_node(&mut i_block, 4, 0, &extents);
                } else {
                    let mut leaf = vec![0_u8; bs];
                    write_extent_node(&mut leaf, ((bs - 12) / 12) as u16, 0, &extents);
                    let leaf_block = alloc.write(image, &leaf);
                    total += 1;
                    let first = extents.first().map_or(0, |e| e.0);
                    put_le(&mut i_block, 0, EXTENT_MAGIC, 2);
                    put_le(&mut i_block, 2, 1, 2);
                    put_le(&mut i_block, 4, 4, 2);
                    put_le(&mut i_block, 6, 1, 2);
                    put_le(&mut i_block, 12, u64::from(first), 4);
                    put_le(&mut i_block, 16, leaf_block & 0xFFFF_FFFF, 4);
                    put_le(&mut i_block, 20, leaf_block >> 32, 2);
                }
                (EXTENTS_FL, i_block, total)
            }
        }
    }
}

struct Allocator {
    bs: usize,
    next: u64,
}

impl Allocator {
    /// Write `data` into fresh blocks; at least one block is taken.
    fn write(&mut self, image: &mut Vec<u8>, data: &[u8]) -> u64 {
        let n = data.len().div_ceil(self.bs).max(1);
        let start = self.next;
        let at = start as usize * self.bs;
        if image.len() < at + n * self.bs {
            image.resize(at + n * self.bs, 0);
        }
        image[at..at + data.len()].copy_from_slice(data);
        self.next += n as u64;
        start
    }
}

fn write_extent_node(node: &mut [u8], max: u16, depth: u16, extents: &[(u32, u16, u64)]) {
    put_le(node, 0, EXTENT_MAGIC, 2);
    put_le(node, 2, extents.len() as u64, 2);
    put_le(node, 4, u64::from(max), 2);
    put_le(node, 6, u64::from(depth), 2);
    for (i, (lblock, len, start)) in extents.iter().enumerate() {
        let at = 12 + i * 12;
        put_le(node, at, u64::from(*lblock), 4);
        put_le(node, at + 4, u64::from(*len), 2);
        put_le(node, at + 6, start >> 32, 2);
        put_le(node, at + 8, start & 0xFFFF_FFFF, 4);
    }
}

/// Build direct, single and double indirect pointers for `physical`.
/// Returns the 15 `i_block` words and the number of metadata blocks used.
fn indirect_pointers(image: &mut Vec<u8>, alloc: &mut Allocator, physical: &[u64]) -> ([u32; 15], u64) {
    let per_block = alloc.bs / 4;
    let mut ptrs = [0_u32; 15];
    let mut meta = 0;
    for (i, p) in physical.iter().take(12).enumerate() {
        ptrs[i] = *p as u32;
    }
    let mut rest = physical.iter().skip(12).copied().collect::<Vec<_>>();
    if rest.is_empty() {
        return (ptrs, meta);
    }
    let single: Vec<u64> = rest.drain(..rest.len().min(per_block)).collect();
    ptrs[12] = alloc.write(image, &pointer_block(&single, alloc.bs)) as u32;
    meta += 1;
    if rest.is_empty() {
        return (ptrs, meta);
    }
    assert!(rest.len() <= per_block * per_block, "triple indirect not built");
    let mut level1 = Vec::new();
    for chunk in rest.chunks(per_block) {
        level1.push(alloc.write(image, &pointer_block(chunk, alloc.bs)));
        meta += 1;
    }
    ptrs[13] = alloc.write(image, &pointer_block(&level1, alloc.bs)) as u32;
    meta += 1;
    (ptrs, meta)
}

fn pointer_block(pointers: &[u64], bs: usize) -> Vec<u8> {
    let mut block = vec![0_u8; bs];
    for (i, p) in pointers.iter().enumerate() {
        put_le(&mut block, i * 4, *p, 4);
    }
    block
}

/// Pack entries into linear directory blocks; the last entry of each block
/// absorbs the slack.
fn dir_blocks(entries: &[(u32, u8, Vec<u8>)], bs: usize) -> Vec<u8> {
    let mut out = vec![0_u8; bs];
    let mut block_start = 0;
    let mut at = 0;
    let mut last = None;
    for (ino, ft, name) in entries {
        let need = (8 + name.len() + 3) & !3;
        if at + need > block_start + bs {
            if let Some(prev) = last {
                put_le(&mut out, prev + 4, (block_start + bs - prev) as u64, 2);
            }
            block_start += bs;
            at = block_start;
            out.resize(block_start + bs, 0);
        }
        put_le(&mut out, at, u64::from(*ino), 4);
        put_le(&mut out, at + 4, need as u64, 2);
        out[at + 6] = name.len() as u8;
        out[at + 7] = *ft;
        out[at + 8..at + 8 + name.len()].copy_from_slice(name);
        last = Some(at);
        at += need;
    }
    if let Some(prev) = last {
        put_le(&mut out, prev + 4, (block_start + bs - prev) as u64, 2);
    }
    out
}

fn inode_csum(raw: &[u8], seed: u32, ino: u32) -> u32 {
    let generation = &raw[0x64..0x68];
    let mut csum = crc32c::crc32c_append(seed, &ino.to_le_bytes());
    csum = crc32c::crc32c_append(csum, generation);
    csum = crc32c::crc32c_append(csum, &raw[..0x7C]);
    csum = crc32c::crc32c_append(csum, &[0, 0]);
    csum = crc32c::crc32c_append(csum, &raw[0x7E..0x82]);
    csum = crc32c::crc32c_append(csum, &[0, 0]);
    crc32c::crc32c_append(csum, &raw[0x84..])
}
