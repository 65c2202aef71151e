//! ext2/ext3/ext4 structures: superblock, group descriptors, inodes,
//! extent tree nodes and linear directory blocks.

use serde::{Deserialize, Serialize};
use vms_types::{
    EXT4_SUPER_MAGIC, EXT4_SUPERBLOCK_OFFSET, EXT4_SUPERBLOCK_SIZE, GroupNumber, InodeNumber,
    ParseError, ensure_slice, ext4_block_size_from_log, format_uuid, inode_index_in_group,
    inode_to_group, read_fixed, read_le_u16, read_le_u32, trim_nul_padded,
};

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFSOCK: u16 = 0o140_000;
pub const S_IFLNK: u16 = 0o120_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFBLK: u16 = 0o060_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFCHR: u16 = 0o020_000;
pub const S_IFIFO: u16 = 0o010_000;

pub const EXT4_INDEX_FL: u32 = 0x0000_1000;
pub const EXT4_HUGE_FILE_FL: u32 = 0x0004_0000;
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

/// `i_block` holds 15 32-bit words: 12 direct pointers, then single, double
/// and triple indirect pointers.
pub const EXT4_N_BLOCKS: usize = 15;
pub const EXT4_NDIR_BLOCKS: usize = 12;
pub const EXT4_IND_BLOCK: usize = 12;
pub const EXT4_DIND_BLOCK: usize = 13;
pub const EXT4_TIND_BLOCK: usize = 14;
/// Symlink targets up to this length live inside `i_block`.
pub const EXT4_FAST_SYMLINK_MAX: usize = 60;
pub const EXT4_ROOT_INO: u32 = 2;

pub const EXT4_EXTENT_MAGIC: u16 = 0xF30A;
const EXT_INIT_MAX_LEN: u16 = 1_u16 << 15;
/// Kernel limit on extent tree depth.
pub const EXT4_MAX_EXTENT_DEPTH: u16 = 5;

// ── superblock state ───────────────────────────────────────────────────────

pub const FS_STATE_CLEAN: u16 = 0x0001;
pub const FS_STATE_ERRORS: u16 = 0x0002;
pub const FS_STATE_ORPHAN_RECOVERY: u16 = 0x0004;
const FS_STATE_ALL: u16 = FS_STATE_CLEAN | FS_STATE_ERRORS | FS_STATE_ORPHAN_RECOVERY;
/// Highest defined error policy (`panic`).
const ERRORS_PANIC: u16 = 3;

// ── feature flags ──────────────────────────────────────────────────────────

/// `s_feature_compat`. Advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4CompatFeatures(pub u32);

impl Ext4CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const NAMES: &'static [(u32, &'static str)] = &[
        (0x0001, "dir_prealloc"),
        (0x0004, "has_journal"),
        (0x0008, "ext_attr"),
        (0x0010, "resize_inode"),
        (0x0020, "dir_index"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_bits(self.0, Self::NAMES)
    }
}

/// `s_feature_incompat`. Unknown bits mean the layout may not be readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4IncompatFeatures(pub u32);

impl Ext4IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const MMP: Self = Self(0x0100);
    pub const FLEX_BG: Self = Self(0x0200);
    pub const EA_INODE: Self = Self(0x0400);
    pub const DIRDATA: Self = Self(0x1000);
    pub const CSUM_SEED: Self = Self(0x2000);
    pub const LARGEDIR: Self = Self(0x4000);
    pub const INLINE_DATA: Self = Self(0x8000);
    pub const ENCRYPT: Self = Self(0x10000);

    const NAMES: &'static [(u32, &'static str)] = &[
        (0x0001, "compression"),
        (0x0002, "filetype"),
        (0x0004, "recover"),
        (0x0008, "journal_dev"),
        (0x0010, "meta_bg"),
        (0x0040, "extents"),
        (0x0080, "64bit"),
        (0x0100, "mmp"),
        (0x0200, "flex_bg"),
        (0x0400, "ea_inode"),
        (0x1000, "dirdata"),
        (0x2000, "metadata_csum_seed"),
        (0x4000, "largedir"),
        (0x8000, "inline_data"),
        (0x10000, "encrypt"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_bits(self.0, Self::NAMES)
    }
}

/// `s_feature_ro_compat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4RoCompatFeatures(pub u32);

impl Ext4RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const HUGE_FILE: Self = Self(0x0008);
    pub const GDT_CSUM: Self = Self(0x0010);
    pub const DIR_NLINK: Self = Self(0x0020);
    pub const EXTRA_ISIZE: Self = Self(0x0040);
    pub const METADATA_CSUM: Self = Self(0x0400);

    const NAMES: &'static [(u32, &'static str)] = &[
        (0x0001, "sparse_super"),
        (0x0002, "large_file"),
        (0x0008, "huge_file"),
        (0x0010, "gdt_csum"),
        (0x0020, "dir_nlink"),
        (0x0040, "extra_isize"),
        (0x0400, "metadata_csum"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_bits(self.0, Self::NAMES)
    }
}

fn describe_bits(bits: u32, names: &[(u32, &'static str)]) -> Vec<&'static str> {
    names
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// ── superblock ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub rev_level: u32,
    pub creator_os: u32,
    pub first_ino: u32,
    /// Raw `s_inode_size`; see [`Ext4Superblock::inode_size`].
    pub raw_inode_size: u16,
    pub feature_compat: Ext4CompatFeatures,
    pub feature_incompat: Ext4IncompatFeatures,
    pub feature_ro_compat: Ext4RoCompatFeatures,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,
    pub desc_size: u16,
    pub checksum_seed: u32,
    pub checksum: u32,
}

impl Ext4Superblock {
    /// Decode the 1024-byte superblock region. Only the magic is checked
    /// here; [`Ext4Superblock::validate`] does the consistency checks.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, EXT4_SUPERBLOCK_SIZE)?;
        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let incompat = Ext4IncompatFeatures(read_le_u32(region, 0x60)?);
        let hi = |offset| -> Result<u64, ParseError> {
            if incompat.contains(Ext4IncompatFeatures::BIT64) {
                Ok(u64::from(read_le_u32(region, offset)?) << 32)
            } else {
                Ok(0)
            }
        };

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = ext4_block_size_from_log(log_block_size)
            .filter(|bs| (1024..=65536).contains(bs))
            .ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "block size outside 1 KiB..64 KiB",
            })?;

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: u64::from(read_le_u32(region, 0x04)?) | hi(0x150)?,
            free_blocks_count: u64::from(read_le_u32(region, 0x0C)?) | hi(0x158)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            rev_level: read_le_u32(region, 0x4C)?,
            creator_os: read_le_u32(region, 0x48)?,
            first_ino: read_le_u32(region, 0x54)?,
            raw_inode_size: read_le_u16(region, 0x58)?,
            feature_compat: Ext4CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: incompat,
            feature_ro_compat: Ext4RoCompatFeatures(read_le_u32(region, 0x64)?),
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),
            desc_size: read_le_u16(region, 0xFE)?,
            checksum_seed: read_le_u32(region, 0x270)?,
            checksum: read_le_u32(region, 0x3FC)?,
        })
    }

    /// Decode the superblock of a whole image held in memory.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        Self::parse_superblock_region(ensure_slice(
            image,
            EXT4_SUPERBLOCK_OFFSET,
            EXT4_SUPERBLOCK_SIZE,
        )?)
    }

    /// Qualification checks run before a volume is accepted as ext2/3/4.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.state > FS_STATE_ALL {
            return Err(ParseError::InvalidField {
                field: "s_state",
                reason: "undefined state bits",
            });
        }
        if self.errors > ERRORS_PANIC {
            return Err(ParseError::InvalidField {
                field: "s_errors",
                reason: "undefined error policy",
            });
        }
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds one bitmap block",
            });
        }
        if u64::from(self.first_data_block) >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "beyond the block count",
            });
        }
        let inode_size = self.inode_size();
        if inode_size < 128 || !inode_size.is_power_of_two() || u32::from(inode_size) > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two between 128 and the block size",
            });
        }
        let groups = u64::from(self.groups_count());
        if groups == 0 || groups * u64::from(self.inodes_per_group) < u64::from(self.inodes_count) {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inconsistent with the block group count",
            });
        }
        if self.is_64bit() && (self.desc_size < 64 || !self.desc_size.is_power_of_two()) {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "64-bit descriptors must be a power of two >= 64",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.state & FS_STATE_ERRORS != 0
    }

    #[must_use]
    pub fn orphans_recovering(&self) -> bool {
        self.state & FS_STATE_ORPHAN_RECOVERY != 0
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.feature_incompat.contains(Ext4IncompatFeatures::BIT64)
    }

    /// Revision 0 filesystems have fixed 128-byte inodes.
    #[must_use]
    pub fn inode_size(&self) -> u16 {
        if self.rev_level == 0 {
            128
        } else {
            self.raw_inode_size
        }
    }

    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() { self.desc_size.max(64) } else { 32 }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // ext4 group count is u32
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(u64::from(self.first_data_block))
            .div_ceil(u64::from(self.blocks_per_group)) as u32
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks_count.saturating_mul(u64::from(self.block_size))
    }

    /// Canonical UUID string, the value `UUID=` fstab specs match.
    #[must_use]
    pub fn uuid_string(&self) -> String {
        format_uuid(&self.uuid)
    }

    /// Byte address of `block`.
    ///
    /// With 1 KiB blocks block 1 starts where the superblock does; an
    /// address landing exactly on the superblock is moved past the
    /// superblock and the group descriptor table.
    #[must_use]
    pub fn block_to_address(&self, block: u64) -> Option<u64> {
        let address = block.checked_mul(u64::from(self.block_size))?;
        if address == EXT4_SUPERBLOCK_OFFSET as u64 {
            let gdt = u64::from(self.group_desc_size()) * u64::from(self.groups_count());
            return address.checked_add(EXT4_SUPERBLOCK_SIZE as u64 + gdt);
        }
        Some(address)
    }

    /// Byte address of the descriptor for `group`. The table starts in the
    /// block after the one holding the superblock.
    #[must_use]
    pub fn group_desc_address(&self, group: GroupNumber) -> Option<u64> {
        let table = (u64::from(self.first_data_block) + 1).checked_mul(u64::from(self.block_size))?;
        table.checked_add(u64::from(group.0).checked_mul(u64::from(self.group_desc_size()))?)
    }

    /// `(group, byte offset inside that group's inode table)` of `ino`.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNumber) -> (GroupNumber, u64) {
        let group = inode_to_group(ino, self.inodes_per_group);
        let index = inode_index_in_group(ino, self.inodes_per_group);
        (group, u64::from(index) * u64::from(self.inode_size()))
    }

    #[must_use]
    pub fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat
            .contains(Ext4RoCompatFeatures::METADATA_CSUM)
    }

    /// Seed for per-object metadata checksums.
    #[must_use]
    pub fn csum_seed(&self) -> u32 {
        if self
            .feature_incompat
            .contains(Ext4IncompatFeatures::CSUM_SEED)
        {
            self.checksum_seed
        } else {
            crc32c::crc32c_append(!0_u32, &self.uuid)
        }
    }

    /// `true` when checksums are off or the stored CRC32C matches.
    #[must_use]
    pub fn checksum_matches(&self, region: &[u8]) -> bool {
        if !self.has_metadata_csum() || region.len() < EXT4_SUPERBLOCK_SIZE {
            return true;
        }
        crc32c::crc32c_append(!0_u32, &region[..0x3FC]) == self.checksum
    }
}

// ── group descriptors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
}

impl Ext4GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let size = usize::from(desc_size);
        if size < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        ensure_slice(bytes, 0, size)?;
        let wide = size >= 64;
        let hi32 = |offset| -> Result<u64, ParseError> {
            if wide {
                Ok(u64::from(read_le_u32(bytes, offset)?) << 32)
            } else {
                Ok(0)
            }
        };
        let hi16 = |offset| -> Result<u32, ParseError> {
            if wide {
                Ok(u32::from(read_le_u16(bytes, offset)?) << 16)
            } else {
                Ok(0)
            }
        };
        Ok(Self {
            block_bitmap: u64::from(read_le_u32(bytes, 0x00)?) | hi32(0x20)?,
            inode_bitmap: u64::from(read_le_u32(bytes, 0x04)?) | hi32(0x24)?,
            inode_table: u64::from(read_le_u32(bytes, 0x08)?) | hi32(0x28)?,
            free_blocks_count: u32::from(read_le_u16(bytes, 0x0C)?) | hi16(0x2C)?,
            free_inodes_count: u32::from(read_le_u16(bytes, 0x0E)?) | hi16(0x2E)?,
            used_dirs_count: u32::from(read_le_u16(bytes, 0x10)?) | hi16(0x30)?,
            flags: read_le_u16(bytes, 0x12)?,
        })
    }
}

// ── inodes ─────────────────────────────────────────────────────────────────

const INODE_CHECKSUM_LO_OFFSET: usize = 0x7C;
const INODE_CHECKSUM_HI_OFFSET: usize = 0x82;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    /// 512-byte sectors unless `EXT4_HUGE_FILE_FL` is set.
    pub blocks: u64,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub atime_extra: u32,
    pub ctime_extra: u32,
    pub mtime_extra: u32,
    pub extra_isize: u16,
    pub checksum: u32,
    /// Raw `i_block`: an extent tree root, block pointers, or an inline
    /// symlink target.
    pub block_area: Vec<u8>,
}

impl Ext4Inode {
    /// Decode an on-disk inode of at least 128 bytes. Extended timestamp
    /// fields are read when `i_extra_isize` covers them.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, 128)?;
        let extra_isize = if bytes.len() >= 0x82 {
            read_le_u16(bytes, 0x80)?
        } else {
            0
        };
        let extra_end = 128 + usize::from(extra_isize);
        let extended = |offset: usize, width: usize| -> Result<u32, ParseError> {
            if extra_end >= offset + width && bytes.len() >= offset + width {
                if width == 2 {
                    Ok(u32::from(read_le_u16(bytes, offset)?))
                } else {
                    read_le_u32(bytes, offset)
                }
            } else {
                Ok(0)
            }
        };

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: u32::from(read_le_u16(bytes, 0x02)?) | (u32::from(read_le_u16(bytes, 0x78)?) << 16),
            gid: u32::from(read_le_u16(bytes, 0x18)?) | (u32::from(read_le_u16(bytes, 0x7A)?) << 16),
            size: u64::from(read_le_u32(bytes, 0x04)?) | (u64::from(read_le_u32(bytes, 0x6C)?) << 32),
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: u64::from(read_le_u32(bytes, 0x1C)?) | (u64::from(read_le_u16(bytes, 0x74)?) << 32),
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: u64::from(read_le_u32(bytes, 0x68)?)
                | (u64::from(read_le_u16(bytes, 0x76)?) << 32),
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            ctime_extra: extended(0x84, 4)?,
            mtime_extra: extended(0x88, 4)?,
            atime_extra: extended(0x8C, 4)?,
            extra_isize,
            checksum: u32::from(read_le_u16(bytes, INODE_CHECKSUM_LO_OFFSET)?)
                | (extended(INODE_CHECKSUM_HI_OFFSET, 2)? << 16),
            block_area: read_fixed::<60>(bytes, 0x28)?.to_vec(),
        })
    }

    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        self.flags & EXT4_EXTENTS_FL != 0
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        self.flags & EXT4_INLINE_DATA_FL != 0
    }

    #[must_use]
    pub fn has_htree_index(&self) -> bool {
        self.flags & EXT4_INDEX_FL != 0
    }

    /// Short symlinks keep their target in `i_block` and own no data
    /// blocks. Extended-attribute blocks count towards `i_blocks`, so they
    /// are discounted before deciding.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        if !self.is_symlink() || self.uses_extents() || self.size > EXT4_FAST_SYMLINK_MAX as u64 {
            return false;
        }
        let acl_sectors = if self.file_acl != 0 {
            self.blocks.min(8)
        } else {
            0
        };
        self.blocks.saturating_sub(acl_sectors) == 0
    }

    #[must_use]
    pub fn fast_symlink_target(&self) -> Option<&[u8]> {
        if !self.is_fast_symlink() {
            return None;
        }
        self.block_area.get(..usize::try_from(self.size).ok()?)
    }

    /// The 15 block pointers of an indirect-mapped inode.
    #[must_use]
    pub fn block_pointers(&self) -> [u32; EXT4_N_BLOCKS] {
        let mut out = [0_u32; EXT4_N_BLOCKS];
        for (i, chunk) in self.block_area.chunks_exact(4).take(EXT4_N_BLOCKS).enumerate() {
            out[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        out
    }

    /// Seconds since the epoch. The base value is signed and the two low
    /// bits of the extra field extend the range past 2038.
    #[allow(clippy::cast_possible_wrap)]
    fn timestamp(base: u32, extra: u32) -> i64 {
        i64::from(base as i32) + (i64::from(extra & 0x3) << 32)
    }

    #[must_use]
    pub fn atime_secs(&self) -> i64 {
        Self::timestamp(self.atime, self.atime_extra)
    }

    #[must_use]
    pub fn mtime_secs(&self) -> i64 {
        Self::timestamp(self.mtime, self.mtime_extra)
    }

    #[must_use]
    pub fn ctime_secs(&self) -> i64 {
        Self::timestamp(self.ctime, self.ctime_extra)
    }
}

/// CRC32C check of a raw inode under `metadata_csum`.
///
/// The checksum covers the inode with both checksum fields zeroed, seeded
/// by the filesystem seed, the inode number and the generation.
pub fn verify_inode_checksum(
    raw_inode: &[u8],
    csum_seed: u32,
    ino: u32,
    inode_size: u16,
) -> Result<(), ParseError> {
    let computed = inode_checksum(raw_inode, csum_seed, ino, inode_size)?;
    let stored_lo = u32::from(read_le_u16(raw_inode, INODE_CHECKSUM_LO_OFFSET)?);
    let stored_hi = if has_checksum_hi(raw_inode, inode_size)? {
        u32::from(read_le_u16(raw_inode, INODE_CHECKSUM_HI_OFFSET)?)
    } else {
        0
    };
    let computed = if has_checksum_hi(raw_inode, inode_size)? {
        computed
    } else {
        computed & 0xFFFF
    };
    if computed != stored_lo | (stored_hi << 16) {
        return Err(ParseError::InvalidField {
            field: "i_checksum",
            reason: "inode CRC32C mismatch",
        });
    }
    Ok(())
}

fn has_checksum_hi(raw_inode: &[u8], inode_size: u16) -> Result<bool, ParseError> {
    if usize::from(inode_size) < INODE_CHECKSUM_HI_OFFSET + 2 {
        return Ok(false);
    }
    let extra_isize = read_le_u16(raw_inode, 0x80)?;
    Ok(128 + usize::from(extra_isize) >= INODE_CHECKSUM_HI_OFFSET + 2)
}

/// Full 32-bit CRC32C of a raw inode with its checksum fields zeroed.
pub fn inode_checksum(
    raw_inode: &[u8],
    csum_seed: u32,
    ino: u32,
    inode_size: u16,
) -> Result<u32, ParseError> {
    let size = usize::from(inode_size);
    if size < 128 {
        return Err(ParseError::InvalidField {
            field: "s_inode_size",
            reason: "smaller than 128",
        });
    }
    let raw = ensure_slice(raw_inode, 0, size)?;
    let generation = read_le_u32(raw, 0x64)?;
    let mut csum = crc32c::crc32c_append(csum_seed, &ino.to_le_bytes());
    csum = crc32c::crc32c_append(csum, &generation.to_le_bytes());
    csum = crc32c::crc32c_append(csum, &raw[..INODE_CHECKSUM_LO_OFFSET]);
    csum = crc32c::crc32c_append(csum, &[0, 0]);
    csum = crc32c::crc32c_append(csum, &raw[INODE_CHECKSUM_LO_OFFSET + 2..128]);
    if size > 128 {
        if has_checksum_hi(raw, inode_size)? {
            csum = crc32c::crc32c_append(csum, &raw[128..INODE_CHECKSUM_HI_OFFSET]);
            csum = crc32c::crc32c_append(csum, &[0, 0]);
            csum = crc32c::crc32c_append(csum, &raw[INODE_CHECKSUM_HI_OFFSET + 2..]);
        } else {
            csum = crc32c::crc32c_append(csum, &raw[128..]);
        }
    }
    Ok(csum)
}

// ── extent trees ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentHeader {
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Extent {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl Ext4Extent {
    /// Preallocated but never written; reads as zeros.
    #[must_use]
    pub fn is_unwritten(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }

    #[must_use]
    pub fn contains(self, logical_block: u32) -> bool {
        logical_block >= self.logical_block
            && u64::from(logical_block) < u64::from(self.logical_block) + u64::from(self.actual_len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4ExtentIndex {
    pub logical_block: u32,
    pub leaf_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentTree {
    Leaf(Vec<Ext4Extent>),
    Index(Vec<Ext4ExtentIndex>),
}

/// Decode one extent tree node: the 60-byte root in `i_block` or a whole
/// tree block.
pub fn parse_extent_tree(bytes: &[u8]) -> Result<(Ext4ExtentHeader, ExtentTree), ParseError> {
    ensure_slice(bytes, 0, 12)?;
    let magic = read_le_u16(bytes, 0x00)?;
    if magic != EXT4_EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXT4_EXTENT_MAGIC),
            actual: u64::from(magic),
        });
    }
    let header = Ext4ExtentHeader {
        entries: read_le_u16(bytes, 0x02)?,
        max_entries: read_le_u16(bytes, 0x04)?,
        depth: read_le_u16(bytes, 0x06)?,
    };
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    if header.depth > EXT4_MAX_EXTENT_DEPTH {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "extent tree deeper than 5",
        });
    }
    let count = usize::from(header.entries);
    ensure_slice(bytes, 12, count * 12)?;

    if header.depth == 0 {
        let mut extents = Vec::with_capacity(count);
        for idx in 0..count {
            let base = 12 + idx * 12;
            extents.push(Ext4Extent {
                logical_block: read_le_u32(bytes, base)?,
                raw_len: read_le_u16(bytes, base + 4)?,
                physical_start: u64::from(read_le_u32(bytes, base + 8)?)
                    | (u64::from(read_le_u16(bytes, base + 6)?) << 32),
            });
        }
        Ok((header, ExtentTree::Leaf(extents)))
    } else {
        let mut indexes = Vec::with_capacity(count);
        for idx in 0..count {
            let base = 12 + idx * 12;
            indexes.push(Ext4ExtentIndex {
                logical_block: read_le_u32(bytes, base)?,
                leaf_block: u64::from(read_le_u32(bytes, base + 4)?)
                    | (u64::from(read_le_u16(bytes, base + 8)?) << 32),
            });
        }
        Ok((header, ExtentTree::Index(indexes)))
    }
}

// ── directory blocks ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ext4FileType {
    Unknown,
    RegFile,
    Dir,
    Chrdev,
    Blkdev,
    Fifo,
    Sock,
    Symlink,
}

impl Ext4FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// `file_type` of the checksum tail entry at the end of a directory block.
const EXT4_FT_DIR_CSUM: u8 = 0xDE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4DirEntry {
    pub inode: u32,
    pub file_type: Ext4FileType,
    pub name: Vec<u8>,
}

impl Ext4DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

fn rec_len_from_disk(raw: u16, block_size: u32) -> u32 {
    let len = u32::from(raw);
    if block_size == 65536 && (len == 65535 || len == 0) {
        return block_size;
    }
    (len & 0xFFFC) | ((len & 0x3) << 16)
}

/// Live entries of one linear directory block, in on-disk order.
///
/// Deleted entries (inode 0) and the checksum tail are skipped. Hashed
/// (htree) directories keep a fake empty entry at the start of each index
/// block, so walking every block linearly still yields every name once.
pub fn parse_dir_block(block: &[u8], block_size: u32) -> Result<Vec<Ext4DirEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;
    while offset + 8 <= block.len() {
        let inode = read_le_u32(block, offset)?;
        let rec_len = rec_len_from_disk(read_le_u16(block, offset + 4)?, block_size) as usize;
        let name_len = usize::from(ensure_slice(block, offset + 6, 1)?[0]);
        let file_type = ensure_slice(block, offset + 7, 1)?[0];

        if rec_len < 8 {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry shorter than its header",
            });
        }
        let end = offset
            .checked_add(rec_len)
            .filter(|end| *end <= block.len())
            .ok_or(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry extends past block boundary",
            })?;
        if inode == 0 && name_len == 0 && file_type == EXT4_FT_DIR_CSUM && rec_len == 12 {
            break;
        }
        if inode != 0 {
            if offset + 8 + name_len > end {
                return Err(ParseError::InvalidField {
                    field: "name_len",
                    reason: "name extends past rec_len",
                });
            }
            entries.push(Ext4DirEntry {
                inode,
                file_type: Ext4FileType::from_raw(file_type),
                name: block[offset + 8..offset + 8 + name_len].to_vec(),
            });
        }
        offset = end;
    }
    Ok(entries)
}
