//! NTFS structures: boot sector, MFT records and their attributes, data
//! runs, index records and reparse data.
//!
//! Everything here works on byte slices that the caller already read and,
//! for multi-sector records, already passed through [`apply_fixups`].

use serde::{Deserialize, Serialize};
use vms_types::{
    NTFS_OEM_ID, NTFS_OEM_ID_OFFSET, ParseError, ensure_slice, read_fixed, read_le_u16,
    read_le_u32, read_le_u64, read_u8, utf16le_to_string,
};

pub const FILE_RECORD_MAGIC: &[u8; 4] = b"FILE";
pub const INDEX_RECORD_MAGIC: &[u8; 4] = b"INDX";
/// Fixup stride: every 512-byte chunk of a record ends in the sequence number.
pub const FIXUP_STRIDE: usize = 512;

// ── well-known MFT records ─────────────────────────────────────────────────

pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
/// Records below this number are reserved for metafiles.
pub const MFT_FIRST_USER_RECORD: u64 = 16;

// ── attribute types ────────────────────────────────────────────────────────

pub const AT_STANDARD_INFORMATION: u32 = 0x10;
pub const AT_ATTRIBUTE_LIST: u32 = 0x20;
pub const AT_FILE_NAME: u32 = 0x30;
pub const AT_VOLUME_NAME: u32 = 0x60;
pub const AT_VOLUME_INFORMATION: u32 = 0x70;
pub const AT_DATA: u32 = 0x80;
pub const AT_INDEX_ROOT: u32 = 0x90;
pub const AT_INDEX_ALLOCATION: u32 = 0xA0;
pub const AT_BITMAP: u32 = 0xB0;
pub const AT_REPARSE_POINT: u32 = 0xC0;
pub const AT_END: u32 = 0xFFFF_FFFF;

pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

pub const FILE_ATTR_READONLY: u32 = 0x0001;
pub const FILE_ATTR_HIDDEN: u32 = 0x0002;
pub const FILE_ATTR_SYSTEM: u32 = 0x0004;
pub const FILE_ATTR_REPARSE_POINT: u32 = 0x0400;
pub const FILE_ATTR_COMPRESSED: u32 = 0x0800;
pub const FILE_ATTR_ENCRYPTED: u32 = 0x4000;
/// Set in `$FILE_NAME` flags of directories.
pub const FILE_ATTR_DUP_DIRECTORY: u32 = 0x1000_0000;

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;
const SYMLINK_FLAG_RELATIVE: u32 = 0x1;

/// Seconds between 1601-01-01 and 1970-01-01.
const NT_EPOCH_DELTA_SECS: i64 = 11_644_473_600;
const NT_TICKS_PER_SEC: u64 = 10_000_000;

/// Convert a 100 ns NT timestamp to seconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn nt_time_to_unix(nt: u64) -> i64 {
    (nt / NT_TICKS_PER_SEC) as i64 - NT_EPOCH_DELTA_SECS
}

/// Record number part of a 64-bit file reference.
#[must_use]
pub fn file_ref_record(file_ref: u64) -> u64 {
    file_ref & 0x0000_FFFF_FFFF_FFFF
}

// ── boot sector ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    /// Positive: clusters per record. Negative: record size is 2^-n bytes.
    pub clusters_per_mft_record: i8,
    pub clusters_per_index_record: i8,
    pub serial_number: u64,
}

impl NtfsBootSector {
    /// `true` when the OEM id at offset 3 reads `NTFS`.
    #[must_use]
    pub fn has_oem_id(sector: &[u8]) -> bool {
        sector
            .get(NTFS_OEM_ID_OFFSET..NTFS_OEM_ID_OFFSET + 4)
            .is_some_and(|oem| oem == NTFS_OEM_ID)
    }

    pub fn parse(sector: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(sector, 0, 512)?;
        if !Self::has_oem_id(sector) {
            let oem = read_fixed::<4>(sector, NTFS_OEM_ID_OFFSET)?;
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(*NTFS_OEM_ID)),
                actual: u64::from(u32::from_le_bytes(oem)),
            });
        }
        let bytes_per_sector = read_le_u16(sector, 0x0B)?;
        if !bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&bytes_per_sector) {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "must be a power of two between 256 and 4096",
            });
        }
        let raw_spc = read_u8(sector, 0x0D)?;
        // Values above 0x80 encode 2^(256 - n) for clusters over 64 KiB.
        let sectors_per_cluster = if raw_spc > 0x80 {
            1_u32 << (256 - u32::from(raw_spc)).min(31)
        } else {
            u32::from(raw_spc)
        };
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a non-zero power of two",
            });
        }
        let boot = Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors: read_le_u64(sector, 0x28)?,
            mft_lcn: read_le_u64(sector, 0x30)?,
            mftmirr_lcn: read_le_u64(sector, 0x38)?,
            clusters_per_mft_record: i8::from_le_bytes([read_u8(sector, 0x40)?]),
            clusters_per_index_record: i8::from_le_bytes([read_u8(sector, 0x44)?]),
            serial_number: read_le_u64(sector, 0x48)?,
        };
        let record = boot.mft_record_size();
        if !(512..=65536).contains(&record) || !record.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "clusters_per_mft_record",
                reason: "record size outside 512..64 KiB",
            });
        }
        Ok(boot)
    }

    #[must_use]
    pub fn cluster_size(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_cluster)
    }

    fn record_size(&self, raw: i8) -> u64 {
        if raw > 0 {
            u64::from(raw.unsigned_abs()) * self.cluster_size()
        } else {
            1_u64 << u32::from(raw.unsigned_abs()).min(31)
        }
    }

    #[must_use]
    pub fn mft_record_size(&self) -> u64 {
        self.record_size(self.clusters_per_mft_record)
    }

    #[must_use]
    pub fn index_record_size(&self) -> u64 {
        self.record_size(self.clusters_per_index_record)
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / u64::from(self.sectors_per_cluster)
    }

    /// Serial number in the `XXXX-XXXX` form Windows shows.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn serial_string(&self) -> String {
        let low = self.serial_number as u32;
        format!("{:04X}-{:04X}", low >> 16, low & 0xFFFF)
    }
}

// ── fixups ─────────────────────────────────────────────────────────────────

/// Restore the last two bytes of every 512-byte chunk of a multi-sector
/// record from its update sequence array.
pub fn apply_fixups(record: &mut [u8]) -> Result<(), ParseError> {
    let usa_offset = usize::from(read_le_u16(record, 0x04)?);
    let usa_count = usize::from(read_le_u16(record, 0x06)?);
    if usa_count == 0 {
        return Err(ParseError::InvalidField {
            field: "usa_count",
            reason: "update sequence array is empty",
        });
    }
    if (usa_count - 1) * FIXUP_STRIDE > record.len() {
        return Err(ParseError::InvalidField {
            field: "usa_count",
            reason: "update sequence array covers more than the record",
        });
    }
    let usa = ensure_slice(record, usa_offset, usa_count * 2)?.to_vec();
    let usn = [usa[0], usa[1]];
    for i in 1..usa_count {
        let end = i * FIXUP_STRIDE;
        let tail = &mut record[end - 2..end];
        if tail != usn {
            return Err(ParseError::InvalidField {
                field: "update_sequence",
                reason: "sector tail does not match the update sequence number",
            });
        }
        tail.copy_from_slice(&usa[i * 2..i * 2 + 2]);
    }
    Ok(())
}

// ── MFT records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MftRecordHeader {
    pub sequence_number: u16,
    pub link_count: u16,
    pub attrs_offset: u16,
    pub flags: u16,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    /// Non-zero in extension records: reference of the base record.
    pub base_record: u64,
}

impl MftRecordHeader {
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE != 0
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRun {
    pub length: u64,
    /// `None` for a sparse run.
    pub lcn: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeBody {
    Resident(Vec<u8>),
    NonResident {
        start_vcn: u64,
        last_vcn: u64,
        compression_unit: u16,
        allocated_size: u64,
        data_size: u64,
        initialized_size: u64,
        runs: Vec<DataRun>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtfsAttribute {
    pub type_code: u32,
    pub name: String,
    pub flags: u16,
    pub instance: u16,
    pub body: AttributeBody,
}

impl NtfsAttribute {
    #[must_use]
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    #[must_use]
    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.body {
            AttributeBody::Resident(value) => Some(value),
            AttributeBody::NonResident { .. } => None,
        }
    }

    /// Logical length of the attribute value.
    #[must_use]
    pub fn value_len(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident(value) => value.len() as u64,
            AttributeBody::NonResident { data_size, .. } => *data_size,
        }
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags & ATTR_FLAG_ENCRYPTED != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MftRecord {
    pub header: MftRecordHeader,
    pub attributes: Vec<NtfsAttribute>,
}

impl MftRecord {
    /// Decode a record whose fixups were already applied.
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<4>(record, 0)?;
        if &magic != FILE_RECORD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(*FILE_RECORD_MAGIC)),
                actual: u64::from(u32::from_le_bytes(magic)),
            });
        }
        let header = MftRecordHeader {
            sequence_number: read_le_u16(record, 0x10)?,
            link_count: read_le_u16(record, 0x12)?,
            attrs_offset: read_le_u16(record, 0x14)?,
            flags: read_le_u16(record, 0x16)?,
            bytes_in_use: read_le_u32(record, 0x18)?,
            bytes_allocated: read_le_u32(record, 0x1C)?,
            base_record: read_le_u64(record, 0x20)?,
        };
        let limit = usize::try_from(header.bytes_in_use)
            .map_err(|_| ParseError::IntegerConversion {
                field: "bytes_in_use",
            })?
            .min(record.len());

        let mut attributes = Vec::new();
        let mut offset = usize::from(header.attrs_offset);
        while offset + 4 <= limit {
            let type_code = read_le_u32(record, offset)?;
            if type_code == AT_END {
                break;
            }
            let length = read_le_u32(record, offset + 4)? as usize;
            if length < 0x18 || offset + length > limit {
                return Err(ParseError::InvalidField {
                    field: "attribute_length",
                    reason: "attribute overruns the record",
                });
            }
            attributes.push(parse_attribute(&record[offset..offset + length])?);
            offset += length;
        }
        Ok(Self { header, attributes })
    }

    /// Unnamed attributes of `type_code`, in record order.
    pub fn attributes_of(&self, type_code: u32) -> impl Iterator<Item = &NtfsAttribute> {
        self.attributes
            .iter()
            .filter(move |attr| attr.type_code == type_code)
    }

    #[must_use]
    pub fn find(&self, type_code: u32, name: &str) -> Option<&NtfsAttribute> {
        self.attributes
            .iter()
            .find(|attr| attr.type_code == type_code && attr.name == name)
    }
}

fn parse_attribute(bytes: &[u8]) -> Result<NtfsAttribute, ParseError> {
    let type_code = read_le_u32(bytes, 0x00)?;
    let non_resident = read_u8(bytes, 0x08)? != 0;
    let name_len = usize::from(read_u8(bytes, 0x09)?);
    let name_offset = usize::from(read_le_u16(bytes, 0x0A)?);
    let name = if name_len == 0 {
        String::new()
    } else {
        utf16le_to_string(ensure_slice(bytes, name_offset, name_len * 2)?)
    };
    let flags = read_le_u16(bytes, 0x0C)?;
    let instance = read_le_u16(bytes, 0x0E)?;

    let body = if non_resident {
        let runlist_offset = usize::from(read_le_u16(bytes, 0x20)?);
        if runlist_offset > bytes.len() {
            return Err(ParseError::InvalidField {
                field: "runlist_offset",
                reason: "beyond the attribute",
            });
        }
        AttributeBody::NonResident {
            start_vcn: read_le_u64(bytes, 0x10)?,
            last_vcn: read_le_u64(bytes, 0x18)?,
            compression_unit: read_le_u16(bytes, 0x22)?,
            allocated_size: read_le_u64(bytes, 0x28)?,
            data_size: read_le_u64(bytes, 0x30)?,
            initialized_size: read_le_u64(bytes, 0x38)?,
            runs: decode_runlist(&bytes[runlist_offset..])?,
        }
    } else {
        let value_len = read_le_u32(bytes, 0x10)? as usize;
        let value_offset = usize::from(read_le_u16(bytes, 0x14)?);
        AttributeBody::Resident(ensure_slice(bytes, value_offset, value_len)?.to_vec())
    };

    Ok(NtfsAttribute {
        type_code,
        name,
        flags,
        instance,
        body,
    })
}

/// Decode a mapping-pairs array. Each run header packs the size of the
/// length field in its low nibble and the size of the signed LCN delta in
/// the high nibble; a zero-width delta marks a sparse run.
pub fn decode_runlist(bytes: &[u8]) -> Result<Vec<DataRun>, ParseError> {
    let mut runs = Vec::new();
    let mut offset = 0_usize;
    let mut lcn: i64 = 0;
    loop {
        let header = read_u8(bytes, offset)?;
        if header == 0 {
            break;
        }
        let len_size = usize::from(header & 0x0F);
        let off_size = usize::from(header >> 4);
        if len_size == 0 || len_size > 8 || off_size > 8 {
            return Err(ParseError::InvalidField {
                field: "mapping_pairs",
                reason: "bad run header",
            });
        }
        let length_bytes = ensure_slice(bytes, offset + 1, len_size)?;
        let mut length = 0_u64;
        for (i, b) in length_bytes.iter().enumerate() {
            length |= u64::from(*b) << (8 * i);
        }
        let delta_bytes = ensure_slice(bytes, offset + 1 + len_size, off_size)?;
        let run_lcn = if off_size == 0 {
            None
        } else {
            let mut delta = 0_i64;
            for (i, b) in delta_bytes.iter().enumerate() {
                delta |= i64::from(*b) << (8 * i);
            }
            let shift = 64 - 8 * off_size as u32;
            if shift < 64 {
                delta = (delta << shift) >> shift;
            }
            lcn = lcn.checked_add(delta).ok_or(ParseError::InvalidField {
                field: "mapping_pairs",
                reason: "LCN overflow",
            })?;
            Some(u64::try_from(lcn).map_err(|_| ParseError::InvalidField {
                field: "mapping_pairs",
                reason: "negative LCN",
            })?)
        };
        runs.push(DataRun {
            length,
            lcn: run_lcn,
        });
        offset += 1 + len_size + off_size;
    }
    Ok(runs)
}

// ── attribute values ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_change_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
}

impl StandardInformation {
    pub fn parse(value: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            creation_time: read_le_u64(value, 0x00)?,
            modification_time: read_le_u64(value, 0x08)?,
            mft_change_time: read_le_u64(value, 0x10)?,
            access_time: read_le_u64(value, 0x18)?,
            file_attributes: read_le_u32(value, 0x20)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileNamespace {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

impl FileNamespace {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Win32,
            2 => Self::Dos,
            3 => Self::Win32AndDos,
            _ => Self::Posix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNameAttr {
    pub parent: u64,
    pub modification_time: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: FileNamespace,
    pub name: String,
}

impl FileNameAttr {
    pub fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let name_len = usize::from(read_u8(value, 0x40)?);
        Ok(Self {
            parent: read_le_u64(value, 0x00)?,
            modification_time: read_le_u64(value, 0x10)?,
            allocated_size: read_le_u64(value, 0x28)?,
            real_size: read_le_u64(value, 0x30)?,
            flags: read_le_u32(value, 0x38)?,
            namespace: FileNamespace::from_raw(read_u8(value, 0x41)?),
            name: utf16le_to_string(ensure_slice(value, 0x42, name_len * 2)?),
        })
    }

    /// 8.3 aliases that duplicate a long name.
    #[must_use]
    pub fn is_dos_only(&self) -> bool {
        self.namespace == FileNamespace::Dos
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags & FILE_ATTR_DUP_DIRECTORY != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub name: String,
    pub starting_vcn: u64,
    pub file_ref: u64,
    pub attribute_id: u16,
}

pub fn parse_attribute_list(value: &[u8]) -> Result<Vec<AttributeListEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0_usize;
    while offset + 0x1A <= value.len() {
        let length = usize::from(read_le_u16(value, offset + 0x04)?);
        if length < 0x1A {
            return Err(ParseError::InvalidField {
                field: "attribute_list",
                reason: "entry shorter than its header",
            });
        }
        let entry = ensure_slice(value, offset, length)?;
        let name_len = usize::from(read_u8(entry, 0x06)?);
        let name_offset = usize::from(read_u8(entry, 0x07)?);
        let name = if name_len == 0 {
            String::new()
        } else {
            utf16le_to_string(ensure_slice(entry, name_offset, name_len * 2)?)
        };
        entries.push(AttributeListEntry {
            type_code: read_le_u32(entry, 0x00)?,
            name,
            starting_vcn: read_le_u64(entry, 0x08)?,
            file_ref: read_le_u64(entry, 0x10)?,
            attribute_id: read_le_u16(entry, 0x18)?,
        });
        offset += length;
    }
    Ok(entries)
}

/// `$VOLUME_NAME` is a bare UTF-16LE string.
#[must_use]
pub fn parse_volume_name(value: &[u8]) -> String {
    utf16le_to_string(value)
}

// ── indexes ────────────────────────────────────────────────────────────────

const INDEX_ENTRY_SUBNODE: u32 = 0x1;
const INDEX_ENTRY_LAST: u32 = 0x2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file_ref: u64,
    pub key: Option<FileNameAttr>,
    pub subnode_vcn: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoot {
    pub indexed_type: u32,
    pub index_record_size: u32,
    pub clusters_per_index_record: u8,
    pub has_large_index: bool,
    pub entries: Vec<IndexEntry>,
}

impl IndexRoot {
    pub fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let (entries, flags) = parse_index_node(value, 0x10)?;
        Ok(Self {
            indexed_type: read_le_u32(value, 0x00)?,
            index_record_size: read_le_u32(value, 0x08)?,
            clusters_per_index_record: read_u8(value, 0x0C)?,
            has_large_index: flags & 0x1 != 0,
            entries,
        })
    }
}

/// Entries of one `INDX` record whose fixups were already applied.
pub fn parse_index_record(record: &[u8]) -> Result<Vec<IndexEntry>, ParseError> {
    let magic = read_fixed::<4>(record, 0)?;
    if &magic != INDEX_RECORD_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(u32::from_le_bytes(*INDEX_RECORD_MAGIC)),
            actual: u64::from(u32::from_le_bytes(magic)),
        });
    }
    Ok(parse_index_node(record, 0x18)?.0)
}

fn parse_index_node(bytes: &[u8], header_at: usize) -> Result<(Vec<IndexEntry>, u8), ParseError> {
    let entries_offset = read_le_u32(bytes, header_at)? as usize;
    let index_length = read_le_u32(bytes, header_at + 4)? as usize;
    let flags = read_u8(bytes, header_at + 12)?;
    let end = (header_at + index_length).min(bytes.len());
    let mut offset = header_at + entries_offset;
    let mut entries = Vec::new();
    while offset + 0x10 <= end {
        let length = usize::from(read_le_u16(bytes, offset + 0x08)?);
        let key_length = usize::from(read_le_u16(bytes, offset + 0x0A)?);
        let entry_flags = read_le_u32(bytes, offset + 0x0C)?;
        if length < 0x10 || offset + length > end {
            return Err(ParseError::InvalidField {
                field: "index_entry_length",
                reason: "entry overruns the index node",
            });
        }
        let entry = &bytes[offset..offset + length];
        let subnode_vcn = if entry_flags & INDEX_ENTRY_SUBNODE != 0 {
            Some(read_le_u64(entry, length - 8)?)
        } else {
            None
        };
        let last = entry_flags & INDEX_ENTRY_LAST != 0;
        let key = if last || key_length == 0 {
            None
        } else {
            Some(FileNameAttr::parse(ensure_slice(entry, 0x10, key_length)?)?)
        };
        entries.push(IndexEntry {
            file_ref: read_le_u64(entry, 0x00)?,
            key,
            subnode_vcn,
        });
        if last {
            break;
        }
        offset += length;
    }
    Ok((entries, flags))
}

// ── reparse points ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReparsePoint {
    Symlink { target: String, relative: bool },
    Junction { target: String },
    Other { tag: u32 },
}

impl ReparsePoint {
    pub fn parse(value: &[u8]) -> Result<Self, ParseError> {
        let tag = read_le_u32(value, 0x00)?;
        let (buffer_at, relative) = match tag {
            IO_REPARSE_TAG_SYMLINK => (20, read_le_u32(value, 16)? & SYMLINK_FLAG_RELATIVE != 0),
            IO_REPARSE_TAG_MOUNT_POINT => (16, false),
            _ => return Ok(Self::Other { tag }),
        };
        let name = |off_at: usize, len_at: usize| -> Result<String, ParseError> {
            let off = usize::from(read_le_u16(value, off_at)?);
            let len = usize::from(read_le_u16(value, len_at)?);
            Ok(utf16le_to_string(ensure_slice(value, buffer_at + off, len)?))
        };
        let print = name(12, 14)?;
        let target = if print.is_empty() {
            let substitute = name(8, 10)?;
            substitute
                .strip_prefix(r"\??\")
                .map_or(substitute.clone(), str::to_owned)
        } else {
            print
        };
        Ok(if tag == IO_REPARSE_TAG_SYMLINK {
            Self::Symlink { target, relative }
        } else {
            Self::Junction { target }
        })
    }
}
