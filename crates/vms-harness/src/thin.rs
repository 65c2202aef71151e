//! Thin-pool metadata volumes.
//!
//! Block layout (4 KiB metadata blocks):
//!
//! | block | content |
//! |-------|---------|
//! | 0 | superblock |
//! | 1 | device details leaf |
//! | 2 | top-level mapping leaf (device id → device tree root) |
//! | 3 | data space map index leaf |
//! | 4 | data space map bitmap |
//! | 5 | metadata space map index block |
//! | 6 | metadata space map bitmap |
//! | 7.. | per-device block trees |

use std::collections::BTreeMap;

use crate::put_le;

pub const METADATA_BLOCK: usize = 4096;
pub const THIN_MAGIC: u64 = 27_022_010;
const NODE_HEADER: usize = 32;
const INTERNAL: u32 = 1;
const LEAF: u32 = 2;
const FIRST_TREE_BLOCK: u64 = 7;
/// Blocks tracked by one bitmap block.
pub const ENTRIES_PER_BITMAP: u64 = (METADATA_BLOCK as u64 - 16) * 4;

#[derive(Debug, Clone)]
pub struct ThinMetadataBuilder {
    data_block_sectors: u32,
    data_blocks: u64,
    devices: BTreeMap<u64, BTreeMap<u64, u64>>,
    leaf_capacity: usize,
    time: u32,
}

impl ThinMetadataBuilder {
    #[must_use]
    pub fn new(data_block_sectors: u32, data_blocks: u64) -> Self {
        assert!(data_blocks <= ENTRIES_PER_BITMAP, "one data bitmap block only");
        Self {
            data_block_sectors,
            data_blocks,
            devices: BTreeMap::new(),
            leaf_capacity: 126,
            time: 0,
        }
    }

    /// Declare a device with no mappings yet.
    #[must_use]
    pub fn device(mut self, id: u64) -> Self {
        self.devices.entry(id).or_default();
        self
    }

    #[must_use]
    pub fn map(mut self, id: u64, virtual_block: u64, data_block: u64) -> Self {
        assert!(data_block < self.data_blocks, "data block out of range");
        self.devices.entry(id).or_default().insert(virtual_block, data_block);
        self
    }

    /// Split device trees into leaves of at most `n` entries under one
    /// internal node.
    #[must_use]
    pub fn leaf_capacity(mut self, n: usize) -> Self {
        self.leaf_capacity = n.max(1);
        self
    }

    #[must_use]
    pub fn time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut blocks: Vec<Vec<u8>> = vec![Vec::new(); FIRST_TREE_BLOCK as usize];

        // Device trees first so their roots are known.
        let mut roots = Vec::new();
        let mut next = FIRST_TREE_BLOCK;
        for (&id, mappings) in &self.devices {
            let entries: Vec<(u64, Vec<u8>)> = mappings
                .iter()
                .map(|(&vb, &db)| (vb, ((db << 24) | u64::from(self.time)).to_le_bytes().to_vec()))
                .collect();
            let chunks: Vec<&[(u64, Vec<u8>)]> = if entries.is_empty() {
                vec![&entries[..]]
            } else {
                entries.chunks(self.leaf_capacity).collect()
            };
            if chunks.len() == 1 {
                blocks.push(node(next, LEAF, chunks[0], 8));
                roots.push((id, next));
                next += 1;
            } else {
                let internal_at = next;
                next += 1;
                blocks.push(Vec::new());
                let mut children = Vec::new();
                for chunk in chunks {
                    blocks.push(node(next, LEAF, chunk, 8));
                    children.push((chunk[0].0, next.to_le_bytes().to_vec()));
                    next += 1;
                }
                blocks[internal_at as usize] = node(internal_at, INTERNAL, &children, 8);
                roots.push((id, internal_at));
            }
        }
        let total_blocks = next;

        let details: Vec<(u64, Vec<u8>)> = self
            .devices
            .iter()
            .map(|(&id, m)| {
                let mut v = vec![0_u8; 24];
                put_le(&mut v, 0, m.len() as u64, 8);
                put_le(&mut v, 8, 1, 8);
                (id, v)
            })
            .collect();
        blocks[1] = node(1, LEAF, &details, 24);

        let top: Vec<(u64, Vec<u8>)> = roots
            .iter()
            .map(|&(id, root)| (id, root.to_le_bytes().to_vec()))
            .collect();
        blocks[2] = node(2, LEAF, &top, 8);

        let mut used = vec![false; self.data_blocks as usize];
        for mappings in self.devices.values() {
            for &db in mappings.values() {
                used[db as usize] = true;
            }
        }
        let allocated = used.iter().filter(|&&u| u).count() as u64;
        let first_free = used.iter().position(|&u| !u).unwrap_or(used.len()) as u32;
        let mut index = vec![0_u8; 16];
        put_le(&mut index, 0, 4, 8);
        put_le(&mut index, 8, self.data_blocks - allocated, 4);
        put_le(&mut index, 12, u64::from(first_free), 4);
        blocks[3] = node(3, LEAF, &[(0, index)], 16);
        blocks[4] = bitmap(4, &used);

        let meta_used = vec![true; total_blocks as usize];
        let mut meta_index = vec![0_u8; METADATA_BLOCK];
        put_le(&mut meta_index, 8, 5, 8);
        put_le(&mut meta_index, 16, 6, 8);
        put_le(&mut meta_index, 24, 0, 4);
        put_le(&mut meta_index, 28, total_blocks, 4);
        blocks[5] = meta_index;
        blocks[6] = bitmap(6, &meta_used);

        let mut sb = vec![0_u8; METADATA_BLOCK];
        put_le(&mut sb, 32, THIN_MAGIC, 8);
        put_le(&mut sb, 40, 2, 4);
        put_le(&mut sb, 44, u64::from(self.time), 4);
        put_le(&mut sb, 48, 1, 8);
        put_le(&mut sb, 64, self.data_blocks, 8);
        put_le(&mut sb, 72, allocated, 8);
        put_le(&mut sb, 80, 3, 8);
        put_le(&mut sb, 192, total_blocks, 8);
        put_le(&mut sb, 200, total_blocks, 8);
        put_le(&mut sb, 208, 5, 8);
        put_le(&mut sb, 320, 2, 8);
        put_le(&mut sb, 328, 1, 8);
        put_le(&mut sb, 336, u64::from(self.data_block_sectors), 4);
        put_le(&mut sb, 340, (METADATA_BLOCK / 512) as u64, 4);
        put_le(&mut sb, 344, total_blocks, 8);
        blocks[0] = sb;

        blocks.concat()
    }
}

fn node(blocknr: u64, flags: u32, entries: &[(u64, Vec<u8>)], value_size: usize) -> Vec<u8> {
    let max = (METADATA_BLOCK - NODE_HEADER) / (8 + value_size);
    assert!(entries.len() <= max, "node overflow");
    let mut b = vec![0_u8; METADATA_BLOCK];
    put_le(&mut b, 4, u64::from(flags), 4);
    put_le(&mut b, 8, blocknr, 8);
    put_le(&mut b, 16, entries.len() as u64, 4);
    put_le(&mut b, 20, max as u64, 4);
    put_le(&mut b, 24, value_size as u64, 4);
    for (i, (key, value)) in entries.iter().enumerate() {
        put_le(&mut b, NODE_HEADER + i * 8, *key, 8);
        let at = NODE_HEADER + max * 8 + i * value_size;
        b[at..at + value_size].copy_from_slice(value);
    }
    b
}

/// Bitmap block with a reference count of 1 for every `true` entry.
fn bitmap(blocknr: u64, used: &[bool]) -> Vec<u8> {
    let mut b = vec![0_u8; METADATA_BLOCK];
    put_le(&mut b, 8, blocknr, 8);
    for (i, _) in used.iter().enumerate().filter(|(_, u)| **u) {
        let bit = i * 2 + 1;
        b[16 + bit / 8] |= 1 << (bit % 8);
    }
    b
}
