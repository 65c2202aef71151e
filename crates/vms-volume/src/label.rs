//! LVM2 physical volume label, PV header and metadata area header.
//!
//! Layout:
//! - Label header (32 bytes) in one of sectors 0..4: `LABELONE`, the
//!   sector number, a CRC, the offset of the PV header and `LVM2 001`.
//! - PV header: 32-character UUID, device size, then two zero-terminated
//!   lists of `(offset, size)` disk locations: data areas, metadata areas.
//! - Metadata area header (512 bytes at each metadata area offset): magic,
//!   version, start, size and zero-terminated raw locations pointing at the
//!   current metadata text inside the circular buffer.

use vms_block::DiskBackend;
use vms_error::{Result, VmsError};
use vms_types::{ParseError, ensure_slice, parse_error_to_vms, read_le_u32, read_le_u64};

// ── Constants ───────────────────────────────────────────────────────────────

pub const LABEL_ID: &[u8; 8] = b"LABELONE";
pub const LABEL_TYPE: &[u8; 8] = b"LVM2 001";
/// Sectors searched for a label.
pub const LABEL_SCAN_SECTORS: u64 = 4;
pub const MDA_MAGIC: &[u8; 16] = b" LVM2 x[5A%r0N*>";
pub const MDA_HEADER_SIZE: u64 = 512;
const SECTOR: u64 = 512;
const UUID_LEN: usize = 32;
/// Raw location flag: this copy is ignored.
const RAW_LOCN_IGNORED: u32 = 0x1;
/// Bound on disk-location lists; real labels carry one or two entries.
const MAX_LOCATIONS: usize = 16;

/// `(offset, size)` region on a physical volume, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskArea {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvLabel {
    pub label_sector: u64,
    /// Dashed form, as used in the text metadata.
    pub pv_uuid: String,
    pub device_size: u64,
    pub data_areas: Vec<DiskArea>,
    pub metadata_areas: Vec<DiskArea>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdaHeader {
    pub version: u32,
    pub start: u64,
    pub size: u64,
    pub raw_locations: Vec<RawLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLocation {
    pub offset: u64,
    pub size: u64,
    pub checksum: u32,
    pub flags: u32,
}

impl RawLocation {
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.flags & RAW_LOCN_IGNORED != 0
    }
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Insert dashes into a raw 32-character LVM UUID (6-4-4-4-4-4-6).
#[must_use]
pub fn format_lvm_uuid(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect();
    if text.len() != UUID_LEN {
        return text;
    }
    let mut out = String::with_capacity(UUID_LEN + 6);
    let mut at = 0;
    for (i, width) in [6, 4, 4, 4, 4, 4, 6].into_iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.push_str(&text[at..at + width]);
        at += width;
    }
    out
}

/// Decode a label sector. `None` when the sector carries no LVM2 label.
pub fn parse_label_sector(sector: &[u8], sector_no: u64) -> Result<Option<PvLabel>, ParseError> {
    if ensure_slice(sector, 0, 8)? != LABEL_ID {
        return Ok(None);
    }
    if ensure_slice(sector, 24, 8)? != LABEL_TYPE {
        return Ok(None);
    }
    let recorded = read_le_u64(sector, 8)?;
    if recorded != sector_no {
        return Err(ParseError::InvalidField {
            field: "label.sector_xl",
            reason: "does not match the sector it was found in",
        });
    }
    let header_at = usize::try_from(read_le_u32(sector, 20)?)
        .map_err(|_| ParseError::IntegerConversion { field: "label.offset_xl" })?;
    let uuid = ensure_slice(sector, header_at, UUID_LEN)?;
    let device_size = read_le_u64(sector, header_at + UUID_LEN)?;
    let mut at = header_at + UUID_LEN + 8;
    let data_areas = parse_locations(sector, &mut at)?;
    let metadata_areas = parse_locations(sector, &mut at)?;
    Ok(Some(PvLabel {
        label_sector: sector_no,
        pv_uuid: format_lvm_uuid(uuid),
        device_size,
        data_areas,
        metadata_areas,
    }))
}

fn parse_locations(buf: &[u8], at: &mut usize) -> Result<Vec<DiskArea>, ParseError> {
    let mut areas = Vec::new();
    loop {
        let offset = read_le_u64(buf, *at)?;
        let size = read_le_u64(buf, *at + 8)?;
        *at += 16;
        if offset == 0 {
            return Ok(areas);
        }
        if areas.len() == MAX_LOCATIONS {
            return Err(ParseError::InvalidField {
                field: "pv_header.disk_areas",
                reason: "list is not terminated",
            });
        }
        areas.push(DiskArea { offset, size });
    }
}

pub fn parse_mda_header(buf: &[u8]) -> Result<MdaHeader, ParseError> {
    let magic = ensure_slice(buf, 4, 16)?;
    if magic != MDA_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: read_le_u64(MDA_MAGIC, 0)?,
            actual: read_le_u64(buf, 4)?,
        });
    }
    let version = read_le_u32(buf, 20)?;
    let start = read_le_u64(buf, 24)?;
    let size = read_le_u64(buf, 32)?;
    let mut raw_locations = Vec::new();
    let mut at = 40;
    while at + 24 <= buf.len() && raw_locations.len() < MAX_LOCATIONS {
        let offset = read_le_u64(buf, at)?;
        if offset == 0 {
            break;
        }
        raw_locations.push(RawLocation {
            offset,
            size: read_le_u64(buf, at + 8)?,
            checksum: read_le_u32(buf, at + 16)?,
            flags: read_le_u32(buf, at + 20)?,
        });
        at += 24;
    }
    Ok(MdaHeader {
        version,
        start,
        size,
        raw_locations,
    })
}

// ── Device access ───────────────────────────────────────────────────────────

/// Scan the first sectors of `dev` for an LVM2 label.
pub fn read_label(dev: &dyn DiskBackend) -> Result<Option<PvLabel>> {
    let mut sector = vec![0_u8; SECTOR as usize];
    for sector_no in 0..LABEL_SCAN_SECTORS {
        if (sector_no + 1) * SECTOR > dev.len_bytes() {
            break;
        }
        dev.read_exact_at(sector_no * SECTOR, &mut sector)?;
        match parse_label_sector(&sector, sector_no) {
            Ok(Some(label)) => return Ok(Some(label)),
            Ok(None) => {}
            Err(err) => return Err(parse_error_to_vms(format!("LVM label in sector {sector_no}"), &err)),
        }
    }
    Ok(None)
}

/// Read the active metadata text of one metadata area. `None` when the
/// area holds no (non-ignored) copy.
pub fn read_metadata_text(dev: &dyn DiskBackend, area: DiskArea) -> Result<Option<String>> {
    let mut raw = vec![0_u8; MDA_HEADER_SIZE as usize];
    dev.read_exact_at(area.offset, &mut raw)?;
    let header = parse_mda_header(&raw)
        .map_err(|err| parse_error_to_vms(format!("metadata area at {}", area.offset), &err))?;
    if header.start != area.offset {
        tracing::debug!(
            area = area.offset,
            header_start = header.start,
            "metadata area header start differs from PV header"
        );
    }
    let Some(location) = header.raw_locations.iter().find(|l| !l.is_ignored()) else {
        return Ok(None);
    };
    let text = read_circular(dev, &header, location)?;
    Ok(Some(String::from_utf8_lossy(&text).trim_end_matches('\0').to_owned()))
}

/// Read `location` from the circular buffer. Text that runs past the end
/// of the area continues right after the area header.
fn read_circular(dev: &dyn DiskBackend, header: &MdaHeader, location: &RawLocation) -> Result<Vec<u8>> {
    let context = || format!("metadata area at {}", header.start);
    if location.offset < MDA_HEADER_SIZE || location.offset >= header.size {
        return Err(VmsError::corruption(
            context(),
            format!("raw location offset {} outside area of {} bytes", location.offset, header.size),
        ));
    }
    let ring = header.size - MDA_HEADER_SIZE;
    if location.size > ring {
        return Err(VmsError::corruption(
            context(),
            format!("metadata of {} bytes exceeds the {ring}-byte buffer", location.size),
        ));
    }
    let size = usize::try_from(location.size)
        .map_err(|_| VmsError::corruption(context(), "metadata size does not fit in memory"))?;
    let mut text = vec![0_u8; size];
    let first = (header.size - location.offset).min(location.size) as usize;
    dev.read_exact_at(header.start + location.offset, &mut text[..first])?;
    if first < size {
        dev.read_exact_at(header.start + MDA_HEADER_SIZE, &mut text[first..])?;
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    fn label_sector(sector_no: u64) -> Vec<u8> {
        let mut s = vec![0_u8; 512];
        s[0..8].copy_from_slice(LABEL_ID);
        s[8..16].copy_from_slice(&sector_no.to_le_bytes());
        s[20..24].copy_from_slice(&32_u32.to_le_bytes());
        s[24..32].copy_from_slice(LABEL_TYPE);
        s[32..64].copy_from_slice(b"AAAAAABBBBCCCCDDDDEEEEFFFFGGGGGG");
        s[64..72].copy_from_slice(&(8_u64 << 20).to_le_bytes());
        // one data area, terminator, one metadata area, terminator
        s[72..80].copy_from_slice(&(1_u64 << 20).to_le_bytes());
        s[104..112].copy_from_slice(&4096_u64.to_le_bytes());
        s[112..120].copy_from_slice(&(1_u64 << 20).to_le_bytes());
        s
    }

    #[test]
    fn formats_uuid_with_dashes() {
        assert_eq!(
            format_lvm_uuid(b"AAAAAABBBBCCCCDDDDEEEEFFFFGGGGGG"),
            "AAAAAA-BBBB-CCCC-DDDD-EEEE-FFFF-GGGGGG"
        );
        assert_eq!(format_lvm_uuid(b"short"), "short");
    }

    #[test]
    fn decodes_label_and_area_lists() {
        let label = parse_label_sector(&label_sector(1), 1)
            .expect("parse")
            .expect("label");
        assert_eq!(label.pv_uuid, "AAAAAA-BBBB-CCCC-DDDD-EEEE-FFFF-GGGGGG");
        assert_eq!(label.device_size, 8 << 20);
        assert_eq!(label.data_areas, vec![DiskArea { offset: 1 << 20, size: 0 }]);
        assert_eq!(
            label.metadata_areas,
            vec![DiskArea {
                offset: 4096,
                size: 1 << 20
            }]
        );
    }

    #[test]
    fn non_label_sector_is_not_an_error() {
        assert_eq!(parse_label_sector(&[0_u8; 512], 0).expect("parse"), None);
    }

    #[test]
    fn sector_mismatch_is_rejected() {
        assert!(parse_label_sector(&label_sector(1), 2).is_err());
    }

    #[test]
    fn label_found_in_second_sector() {
        let mut image = vec![0_u8; 4096];
        image[512..1024].copy_from_slice(&label_sector(1));
        let dev = MemoryBackend::new(image);
        let label = read_label(&dev).expect("read").expect("label");
        assert_eq!(label.label_sector, 1);
    }

    #[test]
    fn metadata_wraps_around_the_ring() {
        let area_start = 4096_u64;
        let area_size = 2048_u64;
        let mut image = vec![0_u8; 8192];
        let h = area_start as usize;
        image[h + 4..h + 20].copy_from_slice(MDA_MAGIC);
        image[h + 20..h + 24].copy_from_slice(&1_u32.to_le_bytes());
        image[h + 24..h + 32].copy_from_slice(&area_start.to_le_bytes());
        image[h + 32..h + 40].copy_from_slice(&area_size.to_le_bytes());
        // text starts 6 bytes before the end of the area
        let text = b"vg0 { seqno = 1 }";
        let offset = area_size - 6;
        image[h + 40..h + 48].copy_from_slice(&offset.to_le_bytes());
        image[h + 48..h + 56].copy_from_slice(&(text.len() as u64).to_le_bytes());
        image[h + offset as usize..h + area_size as usize].copy_from_slice(&text[..6]);
        image[h + 512..h + 512 + text.len() - 6].copy_from_slice(&text[6..]);

        let dev = MemoryBackend::new(image);
        let got = read_metadata_text(
            &dev,
            DiskArea {
                offset: area_start,
                size: area_size,
            },
        )
        .expect("read")
        .expect("text");
        assert_eq!(got, "vg0 { seqno = 1 }");
    }

    #[test]
    fn bad_mda_magic_is_format_error() {
        let dev = MemoryBackend::new(vec![0_u8; 4096]);
        let err = read_metadata_text(&dev, DiskArea { offset: 0, size: 4096 }).expect_err("bad magic");
        assert!(matches!(err, VmsError::Format(_)));
    }
}
