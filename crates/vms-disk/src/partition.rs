//! MBR, extended-chain and GPT partition table parsing.
//!
//! Parsing never fails on a malformed table: a missing boot signature, a
//! truncated GPT header or a corrupt extended link yields fewer (or zero)
//! partitions and a `warn!`. Only transport errors propagate.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, trace, warn};
use vms_block::{DiskBackend, read_clamped};
use vms_error::Result;
use vms_types::codec::{FieldType, Schema};
use vms_types::{
    Lba, MBR_BOOT_SIGNATURE, MBR_BOOT_SIGNATURE_OFFSET, MBR_DISK_SIGNATURE_OFFSET, MBR_ENTRY_SIZE,
    MBR_PARTITION_TABLE_OFFSET, MBR_PRIMARY_ENTRIES, MBR_SIZE, read_le_u32, read_le_u64,
    utf16le_to_string,
};

pub const PTYPE_EMPTY: u8 = 0x00;
pub const PTYPE_EXTENDED_CHS: u8 = 0x05;
pub const PTYPE_EXTENDED_LBA: u8 = 0x0F;
pub const PTYPE_LINUX_EXTENDED: u8 = 0x85;
pub const PTYPE_LDM: u8 = 0x42;
pub const PTYPE_GPT_PROTECTIVE: u8 = 0xEE;
pub const PTYPE_LINUX: u8 = 0x83;
pub const PTYPE_LINUX_LVM: u8 = 0x8E;

/// First partition number handed to logical partitions.
pub const FIRST_LOGICAL_INDEX: u32 = 5;
/// Extended chains longer than this are treated as circular.
pub const MAX_EXTENDED_DEPTH: usize = 64;
/// Upper bound on GPT entries read from a header.
pub const MAX_GPT_ENTRIES: u32 = 1024;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_ENTRY_SIZE: u32 = 128;

/// Layout of one 16-byte DOS partition table slot.
pub const MBR_ENTRY: Schema = Schema::new(&[
    ("bootable", FieldType::U8),
    ("start_chs", FieldType::Bytes(3)),
    ("ptype", FieldType::U8),
    ("end_chs", FieldType::Bytes(3)),
    ("start_lba", FieldType::U32Le),
    ("sectors", FieldType::U32Le),
]);

/// Which partitioning scheme a disk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    None,
    Mbr,
    Gpt,
    /// Windows dynamic disk. Flagged only; its volumes are not parsed.
    Ldm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum PartitionKind {
    Dos { ptype: u8 },
    Gpt { type_guid: String, unique_guid: String },
}

impl PartitionKind {
    /// DOS type code; GPT partitions report the protective marker.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Dos { ptype } => *ptype,
            Self::Gpt { .. } => PTYPE_GPT_PROTECTIVE,
        }
    }
}

/// One partition found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTableEntry {
    pub index: u32,
    pub kind: PartitionKind,
    pub start_lba: Lba,
    /// Length in sectors.
    pub length: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionScan {
    pub scheme: PartitionScheme,
    pub entries: Vec<PartitionTableEntry>,
}

impl PartitionScan {
    fn none() -> Self {
        Self {
            scheme: PartitionScheme::None,
            entries: Vec::new(),
        }
    }
}

#[must_use]
pub fn is_extended(ptype: u8) -> bool {
    matches!(
        ptype,
        PTYPE_EXTENDED_CHS | PTYPE_EXTENDED_LBA | PTYPE_LINUX_EXTENDED
    )
}

#[derive(Debug, Clone, Copy)]
struct DosEntry {
    ptype: u8,
    start_lba: u64,
    sectors: u64,
}

fn read_sector(dev: &dyn DiskBackend, lba: u64, sector_size: u64) -> Result<Option<Vec<u8>>> {
    let Some(offset) = lba.checked_mul(sector_size) else {
        return Ok(None);
    };
    let mut buf = vec![0_u8; MBR_SIZE];
    let n = read_clamped(dev, offset, &mut buf)?;
    Ok((n == MBR_SIZE).then_some(buf))
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector.get(MBR_BOOT_SIGNATURE_OFFSET..MBR_BOOT_SIGNATURE_OFFSET + 2)
        == Some(&MBR_BOOT_SIGNATURE[..])
}

fn dos_entries(sector: &[u8]) -> Vec<DosEntry> {
    (0..MBR_PRIMARY_ENTRIES)
        .filter_map(|i| {
            let record = MBR_ENTRY
                .decode_at(sector, MBR_PARTITION_TABLE_OFFSET + i * MBR_ENTRY_SIZE)
                .ok()?;
            Some(DosEntry {
                ptype: u8::try_from(record.uint("ptype").ok()?).ok()?,
                start_lba: record.uint("start_lba").ok()?,
                sectors: record.uint("sectors").ok()?,
            })
        })
        .collect()
}

/// Four-byte NT disk signature of an MBR disk.
pub fn read_disk_signature(dev: &dyn DiskBackend) -> Result<Option<u32>> {
    let Some(sector) = read_sector(dev, 0, 512)? else {
        return Ok(None);
    };
    if !has_boot_signature(&sector) {
        return Ok(None);
    }
    Ok(read_le_u32(&sector, MBR_DISK_SIGNATURE_OFFSET).ok())
}

/// Discover the partitions of `dev`.
pub fn scan_partitions(dev: &dyn DiskBackend, sector_size: u64) -> Result<PartitionScan> {
    let Some(mbr) = read_sector(dev, 0, sector_size)? else {
        debug!(len = dev.len_bytes(), "device too small for a partition table");
        return Ok(PartitionScan::none());
    };
    if !has_boot_signature(&mbr) {
        trace!("no DOS boot signature");
        return Ok(PartitionScan::none());
    }

    let primaries = dos_entries(&mbr);
    if primaries.first().map(|e| e.ptype) == Some(PTYPE_GPT_PROTECTIVE) {
        return scan_gpt(dev, sector_size);
    }

    let mut entries = Vec::new();
    let mut next_logical = FIRST_LOGICAL_INDEX;
    for (slot, entry) in primaries.iter().enumerate() {
        if entry.ptype == PTYPE_LDM {
            debug!("dynamic disk (LDM) detected; conventional partitions not reported");
            return Ok(PartitionScan {
                scheme: PartitionScheme::Ldm,
                entries: Vec::new(),
            });
        }
        if entry.ptype == PTYPE_EMPTY || entry.sectors == 0 {
            continue;
        }
        if is_extended(entry.ptype) {
            let mut visited = HashSet::new();
            let logicals = discover_extended(
                dev,
                sector_size,
                entry.start_lba,
                entry.start_lba,
                next_logical,
                0,
                &mut visited,
            )?;
            next_logical += u32::try_from(logicals.len()).unwrap_or(0);
            entries.extend(logicals);
            continue;
        }
        entries.push(PartitionTableEntry {
            index: u32::try_from(slot).unwrap_or(0) + 1,
            kind: PartitionKind::Dos { ptype: entry.ptype },
            start_lba: Lba(entry.start_lba),
            length: entry.sectors,
            name: None,
        });
    }

    Ok(PartitionScan {
        scheme: PartitionScheme::Mbr,
        entries,
    })
}

/// Walk an extended partition chain.
///
/// Each EBR at `table_base` describes one logical partition whose start is
/// relative to `table_base`, and a link to the next EBR whose start is
/// relative to `primary_base`, the first extended partition.
pub fn discover_extended(
    dev: &dyn DiskBackend,
    sector_size: u64,
    primary_base: u64,
    table_base: u64,
    index: u32,
    depth: usize,
    visited: &mut HashSet<u64>,
) -> Result<Vec<PartitionTableEntry>> {
    if depth >= MAX_EXTENDED_DEPTH {
        warn!(table_base, depth, "extended partition chain too deep; truncating");
        return Ok(Vec::new());
    }
    if !visited.insert(table_base) {
        warn!(table_base, "circular extended partition chain; truncating");
        return Ok(Vec::new());
    }
    let Some(ebr) = read_sector(dev, table_base, sector_size)? else {
        warn!(table_base, "extended partition table beyond end of disk");
        return Ok(Vec::new());
    };
    if !has_boot_signature(&ebr) {
        warn!(table_base, "extended partition table without boot signature");
        return Ok(Vec::new());
    }

    let slots = dos_entries(&ebr);
    let mut found = Vec::new();
    let mut next_index = index;
    if let Some(logical) = slots.first() {
        if logical.ptype != PTYPE_EMPTY && logical.sectors != 0 && !is_extended(logical.ptype) {
            found.push(PartitionTableEntry {
                index: next_index,
                kind: PartitionKind::Dos {
                    ptype: logical.ptype,
                },
                start_lba: Lba(table_base + logical.start_lba),
                length: logical.sectors,
                name: None,
            });
            next_index += 1;
        }
    }
    if let Some(link) = slots.get(1) {
        if is_extended(link.ptype) && link.start_lba != 0 {
            found.extend(discover_extended(
                dev,
                sector_size,
                primary_base,
                primary_base + link.start_lba,
                next_index,
                depth + 1,
                visited,
            )?);
        }
    }
    Ok(found)
}

/// Format a GPT GUID (first three fields little-endian).
#[must_use]
pub fn format_guid(raw: &[u8; 16]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
        raw[8],
        raw[9],
        raw[10],
        raw[11],
        raw[12],
        raw[13],
        raw[14],
        raw[15]
    )
}

fn scan_gpt(dev: &dyn DiskBackend, sector_size: u64) -> Result<PartitionScan> {
    let Some(header) = read_sector(dev, 1, sector_size)? else {
        warn!("protective MBR without a GPT header");
        return Ok(PartitionScan::none());
    };
    if &header[0..8] != GPT_SIGNATURE {
        warn!("protective MBR but GPT header signature missing");
        return Ok(PartitionScan::none());
    }
    let (Ok(entries_lba), Ok(count), Ok(entry_size)) = (
        read_le_u64(&header, 72),
        read_le_u32(&header, 80),
        read_le_u32(&header, 84),
    ) else {
        return Ok(PartitionScan::none());
    };
    if entry_size < GPT_MIN_ENTRY_SIZE || entry_size % 8 != 0 {
        warn!(entry_size, "GPT entry size invalid");
        return Ok(PartitionScan::none());
    }
    let entries_lba = if entries_lba == 0 { 2 } else { entries_lba };
    let count = if count > MAX_GPT_ENTRIES {
        warn!(count, "GPT entry count capped at {MAX_GPT_ENTRIES}");
        MAX_GPT_ENTRIES
    } else {
        count
    };

    let entry_size = entry_size as usize;
    let mut table = vec![0_u8; count as usize * entry_size];
    let Some(offset) = entries_lba.checked_mul(sector_size) else {
        return Ok(PartitionScan::none());
    };
    let n = read_clamped(dev, offset, &mut table)?;
    table.truncate(n - n % entry_size);

    let mut entries = Vec::new();
    for (i, raw) in table.chunks_exact(entry_size).enumerate() {
        let mut type_guid = [0_u8; 16];
        type_guid.copy_from_slice(&raw[0..16]);
        if type_guid == [0_u8; 16] {
            continue;
        }
        let mut unique_guid = [0_u8; 16];
        unique_guid.copy_from_slice(&raw[16..32]);
        let (Ok(first), Ok(last)) = (read_le_u64(raw, 32), read_le_u64(raw, 40)) else {
            continue;
        };
        if first == 0 || last < first {
            continue;
        }
        let name = utf16le_to_string(&raw[56..128]);
        entries.push(PartitionTableEntry {
            index: u32::try_from(i).unwrap_or(u32::MAX - 1) + 1,
            kind: PartitionKind::Gpt {
                type_guid: format_guid(&type_guid),
                unique_guid: format_guid(&unique_guid),
            },
            start_lba: Lba(first),
            length: last - first + 1,
            name: (!name.is_empty()).then_some(name),
        });
    }

    Ok(PartitionScan {
        scheme: PartitionScheme::Gpt,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;
    use vms_types::codec::Record;

    fn entry_bytes(ptype: u8, start: u32, sectors: u32) -> Vec<u8> {
        let mut record = Record::new();
        record
            .set_uint("ptype", u64::from(ptype))
            .set_uint("start_lba", u64::from(start))
            .set_uint("sectors", u64::from(sectors));
        MBR_ENTRY.encode(&record).expect("encode")
    }

    fn put_table(disk: &mut [u8], lba: u64, entries: &[(u8, u32, u32)]) {
        let base = usize::try_from(lba * 512).expect("base");
        for (i, (ptype, start, sectors)) in entries.iter().enumerate() {
            let off = base + MBR_PARTITION_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
            disk[off..off + 16].copy_from_slice(&entry_bytes(*ptype, *start, *sectors));
        }
        disk[base + 510] = 0x55;
        disk[base + 511] = 0xAA;
    }

    #[test]
    fn no_signature_means_no_partitions() {
        let dev = MemoryBackend::zeroed(4096);
        let scan = scan_partitions(&dev, 512).expect("scan");
        assert_eq!(scan.scheme, PartitionScheme::None);
        assert!(scan.entries.is_empty());
    }

    #[test]
    fn tiny_device_means_no_partitions() {
        let dev = MemoryBackend::zeroed(100);
        assert!(scan_partitions(&dev, 512).expect("scan").entries.is_empty());
    }

    #[test]
    fn primary_entries_skip_empty_slots() {
        let mut disk = vec![0_u8; 8192];
        put_table(&mut disk, 0, &[(0x83, 2048, 100), (0, 0, 0), (0x07, 4096, 50)]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        assert_eq!(scan.scheme, PartitionScheme::Mbr);
        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[0].index, 1);
        assert_eq!(scan.entries[0].start_lba, Lba(2048));
        assert_eq!(scan.entries[1].index, 3);
        assert_eq!(scan.entries[1].kind.type_code(), 0x07);
    }

    #[test]
    fn ldm_short_circuits_to_zero_partitions() {
        let mut disk = vec![0_u8; 4096];
        put_table(&mut disk, 0, &[(0x07, 63, 100), (PTYPE_LDM, 200, 100)]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        assert_eq!(scan.scheme, PartitionScheme::Ldm);
        assert!(scan.entries.is_empty());
    }

    #[test]
    fn extended_links_are_relative_to_first_extended_partition() {
        // Extended container at LBA 10; EBR #2 lives at 10 + 20 = 30.
        let mut disk = vec![0_u8; 64 * 512];
        put_table(&mut disk, 0, &[(0x83, 1, 8), (PTYPE_EXTENDED_LBA, 10, 40)]);
        put_table(&mut disk, 10, &[(0x83, 2, 5), (PTYPE_EXTENDED_CHS, 20, 10)]);
        put_table(&mut disk, 30, &[(0x82, 2, 6)]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        let found: Vec<(u32, u64, u64)> = scan
            .entries
            .iter()
            .map(|e| (e.index, e.start_lba.0, e.length))
            .collect();
        assert_eq!(found, vec![(1, 1, 8), (5, 12, 5), (6, 32, 6)]);
    }

    #[test]
    fn zero_link_ends_the_chain() {
        let mut disk = vec![0_u8; 32 * 512];
        put_table(&mut disk, 0, &[(PTYPE_EXTENDED_LBA, 4, 20)]);
        put_table(&mut disk, 4, &[(0x83, 1, 2), (PTYPE_EXTENDED_LBA, 0, 20)]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        assert_eq!(scan.entries.len(), 1);
    }

    #[test]
    fn circular_extended_chain_terminates() {
        // EBR at 4 links to 4 + 4 = 8, and EBR at 8 links to itself.
        let mut disk = vec![0_u8; 32 * 512];
        put_table(&mut disk, 0, &[(PTYPE_EXTENDED_LBA, 4, 20)]);
        put_table(&mut disk, 4, &[(0x83, 1, 2), (PTYPE_EXTENDED_LBA, 4, 20)]);
        put_table(&mut disk, 8, &[(0x83, 1, 2), (PTYPE_EXTENDED_LBA, 4, 20)]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        let starts: Vec<u64> = scan.entries.iter().map(|e| e.start_lba.0).collect();
        assert_eq!(starts, vec![5, 9]);
    }

    fn gpt_disk(entries: &[([u8; 16], u64, u64, &str)]) -> Vec<u8> {
        let mut disk = vec![0_u8; 128 * 512];
        put_table(&mut disk, 0, &[(PTYPE_GPT_PROTECTIVE, 1, 127)]);
        let header = &mut disk[512..1024];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        header[72..80].copy_from_slice(&2_u64.to_le_bytes());
        header[80..84].copy_from_slice(&4_u32.to_le_bytes());
        header[84..88].copy_from_slice(&128_u32.to_le_bytes());
        for (i, (guid, first, last, name)) in entries.iter().enumerate() {
            let off = 1024 + i * 128;
            disk[off..off + 16].copy_from_slice(guid);
            disk[off + 16] = 0xAB;
            disk[off + 32..off + 40].copy_from_slice(&first.to_le_bytes());
            disk[off + 40..off + 48].copy_from_slice(&last.to_le_bytes());
            for (j, unit) in name.encode_utf16().enumerate() {
                disk[off + 56 + j * 2..off + 58 + j * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }
        disk
    }

    #[test]
    fn gpt_entries_use_inclusive_last_lba() {
        let linux = [
            0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47,
            0x7D, 0xE4,
        ];
        let disk = gpt_disk(&[
            (linux, 34, 63, "root"),
            ([0_u8; 16], 64, 100, "unused"),
            (linux, 0, 10, "zero-start"),
            (linux, 64, 127, ""),
        ]);
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        assert_eq!(scan.scheme, PartitionScheme::Gpt);
        assert_eq!(scan.entries.len(), 2);
        let root = &scan.entries[0];
        assert_eq!(root.index, 1);
        assert_eq!(root.start_lba, Lba(34));
        assert_eq!(root.length, 30);
        assert_eq!(root.name.as_deref(), Some("root"));
        assert_eq!(
            root.kind,
            PartitionKind::Gpt {
                type_guid: "0FC63DAF-8483-4772-8E79-3D69D8477DE4".to_owned(),
                unique_guid: "000000AB-0000-0000-0000-000000000000".to_owned(),
            }
        );
        assert_eq!(scan.entries[1].index, 4);
        assert_eq!(scan.entries[1].name, None);
    }

    #[test]
    fn gpt_without_header_signature_yields_nothing() {
        let mut disk = gpt_disk(&[]);
        disk[512] = b'X';
        let scan = scan_partitions(&MemoryBackend::new(disk), 512).expect("scan");
        assert!(scan.entries.is_empty());
    }

    #[test]
    fn disk_signature_requires_boot_signature() {
        let mut disk = vec![0_u8; 1024];
        disk[MBR_DISK_SIGNATURE_OFFSET..MBR_DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        let dev = MemoryBackend::new(disk.clone());
        assert_eq!(read_disk_signature(&dev).expect("sig"), None);
        disk[510] = 0x55;
        disk[511] = 0xAA;
        let dev = MemoryBackend::new(disk);
        assert_eq!(read_disk_signature(&dev).expect("sig"), Some(0xDEAD_BEEF));
    }
}
