//! Thin-pool metadata superblock and space-map roots.

use serde::Serialize;
use vms_types::{ParseError, ensure_slice, read_le_u32, read_le_u64, read_fixed};

pub const THIN_MAGIC: u64 = 27_022_010;
/// The superblock always lives in metadata block 0.
pub const SUPERBLOCK_BLOCK: u64 = 0;
pub const SPACE_MAP_ROOT_SIZE: usize = 128;

/// Root of an on-disk space map, stored inline in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpaceMapRoot {
    pub nr_blocks: u64,
    pub nr_allocated: u64,
    /// Data maps: root of the index B-tree. Metadata map: the index block.
    pub bitmap_root: u64,
    pub ref_count_root: u64,
}

impl SpaceMapRoot {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, 32)?;
        Ok(Self {
            nr_blocks: read_le_u64(bytes, 0)?,
            nr_allocated: read_le_u64(bytes, 8)?,
            bitmap_root: read_le_u64(bytes, 16)?,
            ref_count_root: read_le_u64(bytes, 24)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThinSuperblock {
    pub flags: u32,
    pub blocknr: u64,
    pub uuid: [u8; 16],
    pub version: u32,
    pub time: u32,
    pub transaction_id: u64,
    pub held_root: u64,
    pub data_space_map: SpaceMapRoot,
    pub metadata_space_map: SpaceMapRoot,
    pub data_mapping_root: u64,
    pub device_details_root: u64,
    /// Data block size in sectors.
    pub data_block_size: u32,
    /// Metadata block size in sectors.
    pub metadata_block_size: u32,
    pub metadata_nr_blocks: u64,
    pub compat_flags: u32,
    pub compat_ro_flags: u32,
    pub incompat_flags: u32,
}

impl ThinSuperblock {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(bytes, 32)?;
        if magic != THIN_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: THIN_MAGIC,
                actual: magic,
            });
        }
        let sb = Self {
            flags: read_le_u32(bytes, 4)?,
            blocknr: read_le_u64(bytes, 8)?,
            uuid: read_fixed::<16>(bytes, 16)?,
            version: read_le_u32(bytes, 40)?,
            time: read_le_u32(bytes, 44)?,
            transaction_id: read_le_u64(bytes, 48)?,
            held_root: read_le_u64(bytes, 56)?,
            data_space_map: SpaceMapRoot::parse(ensure_slice(bytes, 64, SPACE_MAP_ROOT_SIZE)?)?,
            metadata_space_map: SpaceMapRoot::parse(ensure_slice(bytes, 192, SPACE_MAP_ROOT_SIZE)?)?,
            data_mapping_root: read_le_u64(bytes, 320)?,
            device_details_root: read_le_u64(bytes, 328)?,
            data_block_size: read_le_u32(bytes, 336)?,
            metadata_block_size: read_le_u32(bytes, 340)?,
            metadata_nr_blocks: read_le_u64(bytes, 344)?,
            compat_flags: read_le_u32(bytes, 352)?,
            compat_ro_flags: read_le_u32(bytes, 356)?,
            incompat_flags: read_le_u32(bytes, 360)?,
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.blocknr != SUPERBLOCK_BLOCK {
            return Err(ParseError::InvalidField {
                field: "thin.blocknr",
                reason: "superblock is not in block 0",
            });
        }
        if self.data_block_size == 0 {
            return Err(ParseError::InvalidField {
                field: "thin.data_block_size",
                reason: "zero",
            });
        }
        if self.metadata_block_size == 0 || !self.metadata_block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "thin.metadata_block_size",
                reason: "must be a non-zero power of two",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn data_block_bytes(&self) -> u64 {
        u64::from(self.data_block_size) * 512
    }

    #[must_use]
    pub fn metadata_block_bytes(&self) -> u64 {
        u64::from(self.metadata_block_size) * 512
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> Vec<u8> {
        let mut b = vec![0_u8; 4096];
        b[32..40].copy_from_slice(&THIN_MAGIC.to_le_bytes());
        b[64..72].copy_from_slice(&1000_u64.to_le_bytes());
        b[72..80].copy_from_slice(&3_u64.to_le_bytes());
        b[80..88].copy_from_slice(&5_u64.to_le_bytes());
        b[320..328].copy_from_slice(&1_u64.to_le_bytes());
        b[328..336].copy_from_slice(&2_u64.to_le_bytes());
        b[336..340].copy_from_slice(&128_u32.to_le_bytes());
        b[340..344].copy_from_slice(&8_u32.to_le_bytes());
        b
    }

    #[test]
    fn decodes_roots_and_block_sizes() {
        let sb = ThinSuperblock::parse(&raw()).expect("parse");
        assert_eq!(sb.data_mapping_root, 1);
        assert_eq!(sb.device_details_root, 2);
        assert_eq!(sb.data_block_bytes(), 64 * 1024);
        assert_eq!(sb.metadata_block_bytes(), 4096);
        assert_eq!(
            sb.data_space_map,
            SpaceMapRoot {
                nr_blocks: 1000,
                nr_allocated: 3,
                bitmap_root: 5,
                ref_count_root: 0
            }
        );
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut b = raw();
        b[32] ^= 1;
        assert!(matches!(
            ThinSuperblock::parse(&b),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn zero_data_block_size_is_rejected() {
        let mut b = raw();
        b[336..340].fill(0);
        assert!(ThinSuperblock::parse(&b).is_err());
    }
}
