//! MBR, extended (EBR) and GPT partition tables.

use crate::{SECTOR, place, put_le};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosPart {
    pub ptype: u8,
    pub start: u32,
    pub sectors: u32,
}

impl DosPart {
    #[must_use]
    pub fn new(ptype: u8, start: u32, sectors: u32) -> Self {
        Self {
            ptype,
            start,
            sectors,
        }
    }
}

/// Write a DOS table (up to four entries plus `55 AA`) into sector `lba`.
pub fn write_dos_table(image: &mut Vec<u8>, lba: u64, entries: &[DosPart]) {
    let base = lba as usize * SECTOR;
    if image.len() < base + SECTOR {
        image.resize(base + SECTOR, 0);
    }
    for (slot, entry) in entries.iter().take(4).enumerate() {
        let at = base + 0x1BE + slot * 16;
        image[at + 4] = entry.ptype;
        put_le(image, at + 8, u64::from(entry.start), 4);
        put_le(image, at + 12, u64::from(entry.sectors), 4);
    }
    image[base + 510] = 0x55;
    image[base + 511] = 0xAA;
}

/// Whole disk of `total_sectors` with an MBR holding `entries`.
#[must_use]
pub fn mbr_disk(total_sectors: u64, entries: &[DosPart], signature: u32) -> Vec<u8> {
    let mut image = vec![0_u8; total_sectors as usize * SECTOR];
    write_dos_table(&mut image, 0, entries);
    put_le(&mut image, 0x1B8, u64::from(signature), 4);
    image
}

/// Sectors between consecutive EBRs in [`extended_chain_disk`].
pub const EBR_STRIDE: u64 = 16;
/// LBA of the primary extended partition in [`extended_chain_disk`].
pub const EXTENDED_BASE: u64 = 64;

/// Disk with one extended partition holding a chain of `depth` logical
/// partitions. Every link is stored relative to the primary extended
/// partition. Returns the image and the expected `(start_lba, sectors)` of
/// each logical partition.
#[must_use]
pub fn extended_chain_disk(depth: usize, logical_sectors: u32) -> (Vec<u8>, Vec<(u64, u64)>) {
    assert!(u64::from(logical_sectors) < EBR_STRIDE, "logical partition overlaps next EBR");
    let total = EXTENDED_BASE + EBR_STRIDE * depth as u64 + 8;
    let mut image = mbr_disk(
        total,
        &[DosPart::new(0x0F, EXTENDED_BASE as u32, (total - EXTENDED_BASE) as u32)],
        0x1234_5678,
    );
    let mut expected = Vec::with_capacity(depth);
    for k in 0..depth as u64 {
        let ebr = EXTENDED_BASE + k * EBR_STRIDE;
        let mut entries = vec![DosPart::new(0x83, 1, logical_sectors)];
        if k + 1 < depth as u64 {
            let next_rel = (k + 1) * EBR_STRIDE;
            entries.push(DosPart::new(0x05, next_rel as u32, EBR_STRIDE as u32));
        }
        write_dos_table(&mut image, ebr, &entries);
        expected.push((ebr + 1, u64::from(logical_sectors)));
    }
    (image, expected)
}

#[derive(Debug, Clone)]
pub struct GptPart {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub name: String,
}

/// Linux filesystem data GUID, on-disk byte order.
pub const LINUX_FS_GUID: [u8; 16] = [
    0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
];

/// Disk with a protective MBR, a GPT header at LBA 1 and 128 entries at LBA 2.
#[must_use]
pub fn gpt_disk(total_sectors: u64, parts: &[GptPart]) -> Vec<u8> {
    let mut image = mbr_disk(
        total_sectors,
        &[DosPart::new(0xEE, 1, (total_sectors - 1).min(u64::from(u32::MAX)) as u32)],
        0,
    );
    let mut header = vec![0_u8; SECTOR];
    header[0..8].copy_from_slice(b"EFI PART");
    put_le(&mut header, 8, 0x0001_0000, 4);
    put_le(&mut header, 12, 92, 4);
    put_le(&mut header, 24, 1, 8);
    put_le(&mut header, 32, total_sectors - 1, 8);
    put_le(&mut header, 40, 34, 8);
    put_le(&mut header, 48, total_sectors - 34, 8);
    put_le(&mut header, 72, 2, 8);
    put_le(&mut header, 80, 128, 4);
    put_le(&mut header, 84, 128, 4);
    place(&mut image, SECTOR, &header);

    for (i, part) in parts.iter().enumerate() {
        let mut entry = vec![0_u8; 128];
        entry[0..16].copy_from_slice(&part.type_guid);
        entry[16..32].copy_from_slice(&part.unique_guid);
        put_le(&mut entry, 32, part.first_lba, 8);
        put_le(&mut entry, 40, part.last_lba, 8);
        for (j, unit) in part.name.encode_utf16().take(36).enumerate() {
            put_le(&mut entry, 56 + j * 2, u64::from(unit), 2);
        }
        place(&mut image, 2 * SECTOR + i * 128, &entry);
    }
    image
}
