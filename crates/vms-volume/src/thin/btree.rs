//! Persistent-data B-tree nodes as used by thin-pool metadata.
//!
//! Every node is one metadata block:
//!
//! ```text
//! 0   csum        u32
//! 4   flags       u32   1 = internal, 2 = leaf
//! 8   blocknr     u64
//! 16  nr_entries  u32
//! 20  max_entries u32
//! 24  value_size  u32
//! 28  padding     u32
//! 32  keys        u64 * max_entries
//! ..  values      value_size * max_entries
//! ```
//!
//! Internal node values are child block numbers. A key in an internal node
//! is the lowest key stored below that child.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use vms_block::{DiskBackend, LruCache};
use vms_error::{Result, VmsError};
use vms_types::{ParseError, ensure_slice, parse_error_to_vms, read_le_u32, read_le_u64};

// ── Constants ───────────────────────────────────────────────────────────────

pub const INTERNAL_NODE: u32 = 1;
pub const LEAF_NODE: u32 = 2;
pub const NODE_HEADER_SIZE: usize = 32;
/// Deepest tree walked before the metadata is declared cyclic.
const MAX_DEPTH: usize = 16;
const NODE_CACHE_CAPACITY: usize = 64;

// ── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeNode {
    pub blocknr: u64,
    pub is_leaf: bool,
    pub value_size: usize,
    pub keys: Vec<u64>,
    values: Vec<u8>,
}

impl BtreeNode {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let flags = read_le_u32(block, 4)?;
        let is_leaf = match flags & (INTERNAL_NODE | LEAF_NODE) {
            INTERNAL_NODE => false,
            LEAF_NODE => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "btree.flags",
                    reason: "node must be exactly one of internal or leaf",
                });
            }
        };
        let blocknr = read_le_u64(block, 8)?;
        let nr_entries = read_le_u32(block, 16)? as usize;
        let max_entries = read_le_u32(block, 20)? as usize;
        let value_size = read_le_u32(block, 24)? as usize;
        if nr_entries > max_entries {
            return Err(ParseError::InvalidField {
                field: "btree.nr_entries",
                reason: "exceeds max_entries",
            });
        }
        if !is_leaf && value_size != 8 {
            return Err(ParseError::InvalidField {
                field: "btree.value_size",
                reason: "internal nodes hold 8-byte child pointers",
            });
        }
        let values_at = max_entries
            .checked_mul(8)
            .and_then(|k| k.checked_add(NODE_HEADER_SIZE))
            .ok_or(ParseError::IntegerConversion { field: "btree.max_entries" })?;
        let values_len = nr_entries
            .checked_mul(value_size)
            .ok_or(ParseError::IntegerConversion { field: "btree.value_size" })?;
        let keys = (0..nr_entries)
            .map(|i| read_le_u64(block, NODE_HEADER_SIZE + i * 8))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ParseError::InvalidField {
                field: "btree.keys",
                reason: "keys are not strictly ascending",
            });
        }
        let values = ensure_slice(block, values_at, values_len)?.to_vec();
        Ok(Self {
            blocknr,
            is_leaf,
            value_size,
            keys,
            values,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn value(&self, index: usize) -> &[u8] {
        &self.values[index * self.value_size..(index + 1) * self.value_size]
    }

    /// Child pointer of an internal node.
    pub fn child(&self, index: usize) -> Result<u64, ParseError> {
        read_le_u64(self.value(index), 0)
    }

    /// Index of the last key `<= key`.
    #[must_use]
    pub fn lower_bound(&self, key: u64) -> Option<usize> {
        match self.keys.binary_search(&key) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }
}

// ── Metadata device ─────────────────────────────────────────────────────────

/// Block reader over the thin-pool metadata volume with a node cache.
#[derive(Debug)]
pub struct MetadataReader {
    dev: Arc<dyn DiskBackend>,
    block_size: u64,
    nodes: Mutex<LruCache<u64, Arc<BtreeNode>>>,
}

impl MetadataReader {
    pub fn new(dev: Arc<dyn DiskBackend>, block_size: u64) -> Result<Self> {
        Ok(Self {
            dev,
            block_size,
            nodes: Mutex::new(LruCache::new(NODE_CACHE_CAPACITY)?),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn DiskBackend> {
        &self.dev
    }

    pub fn read_block(&self, blocknr: u64) -> Result<Vec<u8>> {
        let offset = blocknr
            .checked_mul(self.block_size)
            .filter(|o| o.saturating_add(self.block_size) <= self.dev.len_bytes())
            .ok_or_else(|| {
                VmsError::corruption(
                    "thin metadata",
                    format!("block {blocknr} lies beyond the metadata device"),
                )
            })?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.dev.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn node(&self, blocknr: u64) -> Result<Arc<BtreeNode>> {
        if let Some(node) = self.nodes.lock().get_cloned(&blocknr) {
            return Ok(node);
        }
        let block = self.read_block(blocknr)?;
        let node = BtreeNode::parse(&block)
            .map_err(|err| parse_error_to_vms(format!("thin metadata node {blocknr}"), &err))?;
        if node.blocknr != blocknr {
            return Err(VmsError::corruption(
                format!("thin metadata node {blocknr}"),
                format!("node claims to be block {}", node.blocknr),
            ));
        }
        let node = Arc::new(node);
        self.nodes.lock().insert(blocknr, Arc::clone(&node));
        Ok(node)
    }

    /// Exact-match lookup of `key` in the tree rooted at `root`.
    pub fn lookup(&self, root: u64, key: u64) -> Result<Option<Vec<u8>>> {
        let mut blocknr = root;
        for _ in 0..MAX_DEPTH {
            let node = self.node(blocknr)?;
            if node.is_leaf {
                return Ok(node
                    .keys
                    .binary_search(&key)
                    .ok()
                    .map(|i| node.value(i).to_vec()));
            }
            let Some(index) = node.lower_bound(key) else {
                return Ok(None);
            };
            blocknr = node
                .child(index)
                .map_err(|err| parse_error_to_vms(format!("thin metadata node {blocknr}"), &err))?;
            trace!(key, child = blocknr, "btree descend");
        }
        Err(VmsError::corruption(
            "thin metadata",
            format!("tree rooted at {root} is deeper than {MAX_DEPTH}"),
        ))
    }

    /// Visit every leaf entry in key order.
    pub fn walk(&self, root: u64, visit: &mut dyn FnMut(u64, &[u8]) -> Result<()>) -> Result<()> {
        self.walk_inner(root, visit, 0)
    }

    fn walk_inner(
        &self,
        blocknr: u64,
        visit: &mut dyn FnMut(u64, &[u8]) -> Result<()>,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(VmsError::corruption(
                "thin metadata",
                format!("tree through block {blocknr} is deeper than {MAX_DEPTH}"),
            ));
        }
        let node = self.node(blocknr)?;
        for i in 0..node.len() {
            if node.is_leaf {
                visit(node.keys[i], node.value(i))?;
            } else {
                let child = node
                    .child(i)
                    .map_err(|err| parse_error_to_vms(format!("thin metadata node {blocknr}"), &err))?;
                self.walk_inner(child, visit, depth + 1)?;
            }
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.nodes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    const BLOCK: usize = 4096;

    fn node(blocknr: u64, flags: u32, entries: &[(u64, u64)]) -> Vec<u8> {
        let max = (BLOCK - NODE_HEADER_SIZE) / 16;
        let mut b = vec![0_u8; BLOCK];
        b[4..8].copy_from_slice(&flags.to_le_bytes());
        b[8..16].copy_from_slice(&blocknr.to_le_bytes());
        b[16..20].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        b[20..24].copy_from_slice(&(max as u32).to_le_bytes());
        b[24..28].copy_from_slice(&8_u32.to_le_bytes());
        for (i, (k, v)) in entries.iter().enumerate() {
            let k_at = NODE_HEADER_SIZE + i * 8;
            b[k_at..k_at + 8].copy_from_slice(&k.to_le_bytes());
            let v_at = NODE_HEADER_SIZE + max * 8 + i * 8;
            b[v_at..v_at + 8].copy_from_slice(&v.to_le_bytes());
        }
        b
    }

    fn two_level() -> MetadataReader {
        let mut image = node(0, INTERNAL_NODE, &[(0, 1), (100, 2)]);
        image.extend(node(1, LEAF_NODE, &[(3, 30), (7, 70)]));
        image.extend(node(2, LEAF_NODE, &[(100, 1000), (150, 1500)]));
        MetadataReader::new(Arc::new(MemoryBackend::new(image)), BLOCK as u64).expect("reader")
    }

    fn as_u64(v: Option<Vec<u8>>) -> Option<u64> {
        v.map(|b| read_le_u64(&b, 0).expect("value"))
    }

    #[test]
    fn lookup_descends_through_internal_nodes() {
        let reader = two_level();
        assert_eq!(as_u64(reader.lookup(0, 7).expect("lookup")), Some(70));
        assert_eq!(as_u64(reader.lookup(0, 150).expect("lookup")), Some(1500));
        assert_eq!(reader.lookup(0, 8).expect("lookup"), None);
        assert_eq!(reader.lookup(0, 99).expect("lookup"), None);
    }

    #[test]
    fn walk_visits_leaves_in_order() {
        let reader = two_level();
        let mut seen = Vec::new();
        reader
            .walk(0, &mut |k, _| {
                seen.push(k);
                Ok(())
            })
            .expect("walk");
        assert_eq!(seen, vec![3, 7, 100, 150]);
    }

    #[test]
    fn self_referencing_tree_is_corruption() {
        let image = node(0, INTERNAL_NODE, &[(0, 0)]);
        let reader =
            MetadataReader::new(Arc::new(MemoryBackend::new(image)), BLOCK as u64).expect("reader");
        let err = reader.lookup(0, 5).expect_err("cycle");
        assert_eq!(err.class(), vms_error::ErrorClass::CorruptStructure);
    }

    #[test]
    fn misplaced_node_is_corruption() {
        let image = node(9, LEAF_NODE, &[(1, 1)]);
        let reader =
            MetadataReader::new(Arc::new(MemoryBackend::new(image)), BLOCK as u64).expect("reader");
        assert!(reader.lookup(0, 1).is_err());
    }

    #[test]
    fn unsorted_keys_are_rejected() {
        let block = node(0, LEAF_NODE, &[(5, 1), (2, 1)]);
        assert!(BtreeNode::parse(&block).is_err());
    }
}
