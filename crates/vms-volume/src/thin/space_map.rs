//! Space maps: per-block reference counts for the data and metadata devices.
//!
//! Reference counts live in bitmap blocks at two bits per block (a value of
//! 3 means "look in the ref-count tree"). An index locates the bitmap for a
//! block range: for the data device the index is a B-tree keyed by bitmap
//! number, for the metadata device a single array block.

use serde::Serialize;
use vms_error::{Result, VmsError};
use vms_types::{ParseError, parse_error_to_vms, read_le_u32, read_le_u64};

use super::btree::MetadataReader;
use super::superblock::SpaceMapRoot;

/// Bitmap and metadata-index blocks start with csum, padding, blocknr.
const BLOCK_HEADER_SIZE: u64 = 16;
const INDEX_ENTRY_SIZE: usize = 16;
/// Index entries in the metadata space map's index block.
pub const MAX_METADATA_BITMAPS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub blocknr: u64,
    pub nr_free: u32,
    pub none_free_before: u32,
}

impl IndexEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            blocknr: read_le_u64(bytes, 0)?,
            nr_free: read_le_u32(bytes, 8)?,
            none_free_before: read_le_u32(bytes, 12)?,
        })
    }
}

/// Blocks tracked by one bitmap block.
#[must_use]
pub fn entries_per_bitmap(metadata_block_bytes: u64) -> u64 {
    metadata_block_bytes.saturating_sub(BLOCK_HEADER_SIZE) * 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceMapKind {
    Data,
    Metadata,
}

#[derive(Debug)]
pub struct SpaceMap<'a> {
    reader: &'a MetadataReader,
    root: SpaceMapRoot,
    kind: SpaceMapKind,
}

impl<'a> SpaceMap<'a> {
    #[must_use]
    pub fn new(reader: &'a MetadataReader, root: SpaceMapRoot, kind: SpaceMapKind) -> Self {
        Self { reader, root, kind }
    }

    fn per_bitmap(&self) -> u64 {
        entries_per_bitmap(self.reader.block_size())
    }

    fn bitmap_count(&self) -> u64 {
        self.root.nr_blocks.div_ceil(self.per_bitmap().max(1))
    }

    fn context(&self) -> &'static str {
        match self.kind {
            SpaceMapKind::Data => "thin data space map",
            SpaceMapKind::Metadata => "thin metadata space map",
        }
    }

    pub fn index_entries(&self) -> Result<Vec<IndexEntry>> {
        let context = self.context();
        match self.kind {
            SpaceMapKind::Data => {
                let mut entries = Vec::new();
                self.reader.walk(self.root.bitmap_root, &mut |_, value| {
                    entries.push(IndexEntry::parse(value).map_err(|err| parse_error_to_vms(context, &err))?);
                    Ok(())
                })?;
                Ok(entries)
            }
            SpaceMapKind::Metadata => {
                let count = self.bitmap_count() as usize;
                if count > MAX_METADATA_BITMAPS {
                    return Err(VmsError::corruption(
                        context,
                        format!("{count} bitmaps exceed the index block"),
                    ));
                }
                let block = self.reader.read_block(self.root.bitmap_root)?;
                (0..count)
                    .map(|i| {
                        let at = BLOCK_HEADER_SIZE as usize + i * INDEX_ENTRY_SIZE;
                        IndexEntry::parse(block.get(at..).unwrap_or_default())
                            .map_err(|err| parse_error_to_vms(context, &err))
                    })
                    .collect()
            }
        }
    }

    fn index_entry(&self, bitmap: u64) -> Result<Option<IndexEntry>> {
        match self.kind {
            SpaceMapKind::Data => self
                .reader
                .lookup(self.root.bitmap_root, bitmap)?
                .map(|v| IndexEntry::parse(&v).map_err(|err| parse_error_to_vms(self.context(), &err)))
                .transpose(),
            SpaceMapKind::Metadata => Ok(self.index_entries()?.get(bitmap as usize).copied()),
        }
    }

    /// Reference count of `block`.
    pub fn ref_count(&self, block: u64) -> Result<u32> {
        if block >= self.root.nr_blocks {
            return Err(VmsError::corruption(
                self.context(),
                format!("block {block} beyond {} tracked blocks", self.root.nr_blocks),
            ));
        }
        let per = self.per_bitmap();
        let Some(entry) = self.index_entry(block / per)? else {
            return Ok(0);
        };
        let bitmap = self.reader.read_block(entry.blocknr)?;
        match bitmap_value(&bitmap, block % per) {
            3 => {
                let value = self.reader.lookup(self.root.ref_count_root, block)?;
                let Some(value) = value else {
                    return Err(VmsError::corruption(
                        self.context(),
                        format!("block {block} overflows into a missing ref-count entry"),
                    ));
                };
                read_le_u32(&value, 0).map_err(|err| parse_error_to_vms(self.context(), &err))
            }
            v => Ok(u32::from(v)),
        }
    }

    /// Allocated block count recomputed from the bitmap index.
    pub fn counted_allocated(&self) -> Result<u64> {
        let per = self.per_bitmap();
        let mut total = 0_u64;
        for (i, entry) in self.index_entries()?.iter().enumerate() {
            let first = i as u64 * per;
            let covered = per.min(self.root.nr_blocks.saturating_sub(first));
            total += covered.saturating_sub(u64::from(entry.nr_free));
        }
        Ok(total)
    }
}

/// Two-bit entry `index` of a bitmap block. Bit `2i` is the high bit.
#[must_use]
pub fn bitmap_value(block: &[u8], index: u64) -> u8 {
    let bit = index * 2;
    let byte = (BLOCK_HEADER_SIZE + bit / 8) as usize;
    let Some(&b) = block.get(byte) else {
        return 0;
    };
    let shift = bit % 8;
    let hi = (b >> shift) & 1;
    let lo = (b >> (shift + 1)) & 1;
    (hi << 1) | lo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_entries_pack_four_per_byte() {
        let mut block = vec![0_u8; 64];
        block[16] = 0b0000_0110;
        block[17] = 0b0000_1100;
        assert_eq!(bitmap_value(&block, 0), 1);
        assert_eq!(bitmap_value(&block, 1), 2);
        assert_eq!(bitmap_value(&block, 2), 0);
        assert_eq!(bitmap_value(&block, 4), 0);
        assert_eq!(bitmap_value(&block, 5), 3);
        assert_eq!(bitmap_value(&block, 10_000), 0);
    }

    #[test]
    fn entries_per_bitmap_matches_block_size() {
        assert_eq!(entries_per_bitmap(4096), (4096 - 16) * 4);
    }
}
