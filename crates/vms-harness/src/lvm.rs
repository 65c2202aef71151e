//! LVM2 physical volumes carrying text metadata.
//!
//! Image layout: label in sector 1, one metadata area at 4 KiB whose text
//! starts right after the 512-byte area header, first physical extent at
//! 1 MiB.

use std::fmt::Write as _;

use crate::{SECTOR, place, put_le};

pub const PE_START_SECTORS: u64 = 2048;
pub const MDA_OFFSET: usize = 4096;
pub const MDA_SIZE: usize = (1 << 20) - MDA_OFFSET;
const MDA_MAGIC: &[u8; 16] = b" LVM2 x[5A%r0N*>";

/// 32-character raw UUID derived from `tag`.
#[must_use]
pub fn raw_uuid(tag: &str) -> String {
    let mut id: String = tag.chars().filter(char::is_ascii_alphanumeric).take(32).collect();
    while id.len() < 32 {
        id.push('0');
    }
    id
}

/// Dashed 6-4-4-4-4-4-6 form used in metadata text.
#[must_use]
pub fn dashed_uuid(raw: &str) -> String {
    let mut out = String::new();
    let mut at = 0;
    for (i, width) in [6, 4, 4, 4, 4, 4, 6].into_iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        out.push_str(&raw[at..at + width]);
        at += width;
    }
    out
}

/// Byte offset of physical extent `pe` for extents of `extent_sectors`.
#[must_use]
pub fn extent_offset(pe: u64, extent_sectors: u64) -> usize {
    ((PE_START_SECTORS + pe * extent_sectors) as usize) * SECTOR
}

/// PV of `size` bytes labelled `raw_uuid`. `metadata` goes into the single
/// metadata area; `None` leaves the PV without metadata areas.
#[must_use]
pub fn pv_image(raw_uuid: &str, size: usize, metadata: Option<&str>) -> Vec<u8> {
    let mut image = vec![0_u8; size];
    let label = SECTOR;
    image[label..label + 8].copy_from_slice(b"LABELONE");
    put_le(&mut image, label + 8, 1, 8);
    put_le(&mut image, label + 20, 32, 4);
    image[label + 24..label + 32].copy_from_slice(b"LVM2 001");

    let pvh = label + 32;
    image[pvh..pvh + 32].copy_from_slice(raw_uuid.as_bytes());
    put_le(&mut image, pvh + 32, size as u64, 8);
    let mut at = pvh + 40;
    put_le(&mut image, at, PE_START_SECTORS * SECTOR as u64, 8);
    at += 32; // data area plus terminator
    if let Some(text) = metadata {
        put_le(&mut image, at, MDA_OFFSET as u64, 8);
        put_le(&mut image, at + 8, MDA_SIZE as u64, 8);
        write_mda(&mut image, text);
    }
    image
}

fn write_mda(image: &mut Vec<u8>, text: &str) {
    let h = MDA_OFFSET;
    image[h + 4..h + 20].copy_from_slice(MDA_MAGIC);
    put_le(image, h + 20, 1, 4);
    put_le(image, h + 24, MDA_OFFSET as u64, 8);
    put_le(image, h + 32, MDA_SIZE as u64, 8);
    put_le(image, h + 40, SECTOR as u64, 8);
    put_le(image, h + 48, text.len() as u64, 8);
    place(image, h + SECTOR, text.as_bytes());
}

/// One `segmentN { ... }` body.
#[derive(Debug, Clone)]
pub struct SegmentText {
    start: u64,
    count: u64,
    body: String,
}

impl SegmentText {
    #[must_use]
    pub fn linear(start: u64, count: u64, pv: &str, pv_start: u64) -> Self {
        Self::striped(start, count, 0, &[(pv, pv_start)])
    }

    #[must_use]
    pub fn striped(start: u64, count: u64, stripe_size: u64, stripes: &[(&str, u64)]) -> Self {
        let list: Vec<String> = stripes.iter().map(|(pv, s)| format!("\"{pv}\", {s}")).collect();
        let mut body = format!(
            "type = \"striped\"\nstripe_count = {}\nstripes = [\n{}\n]\n",
            stripes.len(),
            list.join(",\n")
        );
        if stripes.len() > 1 {
            let _ = writeln!(body, "stripe_size = {stripe_size}");
        }
        Self { start, count, body }
    }

    #[must_use]
    pub fn thin_pool(start: u64, count: u64, metadata: &str, data: &str, chunk_size: u64) -> Self {
        Self {
            start,
            count,
            body: format!(
                "type = \"thin-pool\"\nmetadata = \"{metadata}\"\npool = \"{data}\"\ntransaction_id = 1\nchunk_size = {chunk_size}\ndiscards = \"passdown\"\nzero_new_blocks = 1\n"
            ),
        }
    }

    #[must_use]
    pub fn thin(start: u64, count: u64, pool: &str, device_id: u64) -> Self {
        Self {
            start,
            count,
            body: format!("type = \"thin\"\nthin_pool = \"{pool}\"\ntransaction_id = 0\ndevice_id = {device_id}\n"),
        }
    }

    /// Segment with no parameters (`zero`, `error`, or an unmapped type).
    #[must_use]
    pub fn typed(start: u64, count: u64, kind: &str) -> Self {
        Self {
            start,
            count,
            body: format!("type = \"{kind}\"\n"),
        }
    }
}

/// Volume group text metadata.
#[derive(Debug, Clone)]
pub struct VgText {
    name: String,
    id: String,
    seqno: u64,
    extent_size: u64,
    pvs: Vec<String>,
    lvs: Vec<String>,
}

impl VgText {
    #[must_use]
    pub fn new(name: &str, seqno: u64, extent_size: u64) -> Self {
        Self {
            name: name.to_owned(),
            id: dashed_uuid(&raw_uuid(&format!("vg{name}"))),
            seqno,
            extent_size,
            pvs: Vec::new(),
            lvs: Vec::new(),
        }
    }

    #[must_use]
    pub fn pv(mut self, name: &str, raw_uuid: &str, pe_count: u64) -> Self {
        self.pvs.push(format!(
            "{name} {{\nid = \"{}\"\ndevice = \"/dev/{name}\"\nstatus = [\"ALLOCATABLE\"]\nflags = []\ndev_size = {}\npe_start = {PE_START_SECTORS}\npe_count = {pe_count}\n}}\n",
            dashed_uuid(raw_uuid),
            PE_START_SECTORS + pe_count * self.extent_size
        ));
        self
    }

    #[must_use]
    pub fn lv(mut self, name: &str, visible: bool, segments: &[SegmentText]) -> Self {
        let status = if visible {
            "[\"READ\", \"WRITE\", \"VISIBLE\"]"
        } else {
            "[\"READ\", \"WRITE\"]"
        };
        let mut text = format!(
            "{name} {{\nid = \"{}\"\nstatus = {status}\nflags = []\nsegment_count = {}\n",
            dashed_uuid(&raw_uuid(&format!("lv{name}"))),
            segments.len()
        );
        for (i, seg) in segments.iter().enumerate() {
            let _ = write!(
                text,
                "\nsegment{} {{\nstart_extent = {}\nextent_count = {}\n\n{}}}\n",
                i + 1,
                seg.start,
                seg.count,
                seg.body
            );
        }
        text.push_str("}\n");
        self.lvs.push(text);
        self
    }

    /// LV UUID as it appears in the rendered metadata.
    #[must_use]
    pub fn lv_uuid(name: &str) -> String {
        dashed_uuid(&raw_uuid(&format!("lv{name}")))
    }

    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{} {{\nid = \"{}\"\nseqno = {}\nformat = \"lvm2\"\nstatus = [\"RESIZEABLE\", \"READ\", \"WRITE\"]\nflags = []\nextent_size = {}\nmax_lv = 0\nmax_pv = 0\nmetadata_copies = 0\n\nphysical_volumes {{\n{}}}\n\nlogical_volumes {{\n{}}}\n}}\n# Generated by LVM2 version 2.03.11(2) (2021-01-08)\n\ncontents = \"Text Format Volume Group\"\nversion = 1\n\ndescription = \"\"\n\ncreation_host = \"builder\"\t# Linux builder\ncreation_time = 1700000000\t# Tue Nov 14 22:13:20 2023\n\n",
            self.name,
            self.id,
            self.seqno,
            self.extent_size,
            self.pvs.concat(),
            self.lvs.concat()
        )
    }
}
