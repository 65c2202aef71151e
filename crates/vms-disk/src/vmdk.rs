//! VMware hosted sparse extents.
//!
//! The extent is divided into grains of `grain_size` sectors. A grain
//! directory points at grain tables, and each grain table entry (GTE) maps
//! one grain:
//!
//! | GTE | meaning |
//! |-----|---------|
//! | 0 | unallocated: read from the parent, or zeros without one |
//! | 1 | explicitly zeroed |
//! | n | grain data starts at sector n of the extent file |
//!
//! Writes to an unallocated grain allocate a new grain past the current
//! high-water mark, copy the parent's contents (or zeros) into it, update
//! the GTE and then apply the write. Stream-optimized extents (embedded
//! markers) are rejected when opened.

use crate::probe::{DiskFormat, FormatContext};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};
use vms_block::{DiskBackend, LruCache, check_range, read_clamped};
use vms_error::{Result, VmsError};
use vms_types::codec::{FieldType, Record, Schema};
use vms_types::{ParseError, SECTOR_SIZE, parse_error_to_vms};

/// "KDMV" read as a little-endian u32.
pub const SPARSE_MAGIC: u32 = 0x564D_444B;
/// Grain directory offset marking a footer-located directory.
pub const GD_AT_END: u64 = u64::MAX;

pub const FLAG_VALID_NEWLINE_TEST: u32 = 1 << 0;
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
pub const FLAG_ZEROED_GTE: u32 = 1 << 2;
pub const FLAG_COMPRESSED: u32 = 1 << 16;
pub const FLAG_MARKERS: u32 = 1 << 17;

pub const COMPRESSION_NONE: u16 = 0;
pub const COMPRESSION_DEFLATE: u16 = 1;

pub const GTE_UNALLOCATED: u32 = 0;
pub const GTE_ZEROED: u32 = 1;

/// Cached grain tables per open extent.
const GRAIN_TABLE_CACHE: usize = 64;
/// Compressed grain header: LBA (u64) and compressed size (u32).
const COMPRESSED_GRAIN_HEADER: usize = 12;

/// On-disk sparse extent header (the first 79 bytes of sector 0).
pub const SPARSE_HEADER: Schema = Schema::new(&[
    ("magic", FieldType::U32Le),
    ("version", FieldType::U32Le),
    ("flags", FieldType::U32Le),
    ("capacity", FieldType::U64Le),
    ("grain_size", FieldType::U64Le),
    ("descriptor_offset", FieldType::U64Le),
    ("descriptor_size", FieldType::U64Le),
    ("num_gtes_per_gt", FieldType::U32Le),
    ("rgd_offset", FieldType::U64Le),
    ("gd_offset", FieldType::U64Le),
    ("overhead", FieldType::U64Le),
    ("unclean_shutdown", FieldType::U8),
    ("single_end_line_char", FieldType::U8),
    ("non_end_line_char", FieldType::U8),
    ("double_end_line_char1", FieldType::U8),
    ("double_end_line_char2", FieldType::U8),
    ("compress_algorithm", FieldType::U16Le),
]);

/// Decoded sparse extent header. Sizes and offsets are in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    pub capacity: u64,
    pub grain_size: u64,
    pub descriptor_offset: u64,
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    pub rgd_offset: u64,
    pub gd_offset: u64,
    pub overhead: u64,
    pub compress_algorithm: u16,
}

fn narrow<T: TryFrom<u64>>(record: &Record, field: &'static str) -> Result<T, ParseError> {
    T::try_from(record.uint(field)?).map_err(|_| ParseError::IntegerConversion { field })
}

impl SparseHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = SPARSE_HEADER.decode(bytes)?;
        let magic = record.uint("magic")?;
        if magic != u64::from(SPARSE_MAGIC) {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SPARSE_MAGIC),
                actual: magic,
            });
        }
        Ok(Self {
            version: narrow(&record, "version")?,
            flags: narrow(&record, "flags")?,
            capacity: record.uint("capacity")?,
            grain_size: record.uint("grain_size")?,
            descriptor_offset: record.uint("descriptor_offset")?,
            descriptor_size: record.uint("descriptor_size")?,
            num_gtes_per_gt: narrow(&record, "num_gtes_per_gt")?,
            rgd_offset: record.uint("rgd_offset")?,
            gd_offset: record.uint("gd_offset")?,
            overhead: record.uint("overhead")?,
            compress_algorithm: narrow(&record, "compress_algorithm")?,
        })
    }

    /// Encode into a full 512-byte header sector.
    pub fn to_sector(&self) -> Result<Vec<u8>, ParseError> {
        let mut record = Record::new();
        record
            .set_uint("magic", u64::from(SPARSE_MAGIC))
            .set_uint("version", u64::from(self.version))
            .set_uint("flags", u64::from(self.flags))
            .set_uint("capacity", self.capacity)
            .set_uint("grain_size", self.grain_size)
            .set_uint("descriptor_offset", self.descriptor_offset)
            .set_uint("descriptor_size", self.descriptor_size)
            .set_uint("num_gtes_per_gt", u64::from(self.num_gtes_per_gt))
            .set_uint("rgd_offset", self.rgd_offset)
            .set_uint("gd_offset", self.gd_offset)
            .set_uint("overhead", self.overhead)
            .set_uint("single_end_line_char", u64::from(b'\n'))
            .set_uint("non_end_line_char", u64::from(b' '))
            .set_uint("double_end_line_char1", u64::from(b'\r'))
            .set_uint("double_end_line_char2", u64::from(b'\n'))
            .set_uint("compress_algorithm", u64::from(self.compress_algorithm));
        let mut sector = vec![0_u8; 512];
        SPARSE_HEADER.encode_into(&record, &mut sector)?;
        Ok(sector)
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    #[must_use]
    pub fn has_markers(&self) -> bool {
        self.flags & FLAG_MARKERS != 0
    }

    #[must_use]
    pub fn grain_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Number of grains covering the capacity.
    #[must_use]
    pub fn grain_count(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Number of grain directory entries.
    #[must_use]
    pub fn gde_count(&self) -> u64 {
        self.grain_count().div_ceil(u64::from(self.num_gtes_per_gt))
    }

    fn validate(&self, disk: &str) -> Result<()> {
        let bad = |detail: String| Err(VmsError::corruption(format!("{disk} sparse header"), detail));
        if !(1..=3).contains(&self.version) {
            return bad(format!("unsupported version {}", self.version));
        }
        if self.grain_size < 8 || !self.grain_size.is_power_of_two() {
            return bad(format!("grain size {} is not a power of two >= 8", self.grain_size));
        }
        if self.num_gtes_per_gt == 0 {
            return bad("zero grain table entries per table".to_owned());
        }
        if self.capacity == 0 {
            return bad("zero capacity".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VmdkSparseFormat;

impl DiskFormat for VmdkSparseFormat {
    fn name(&self) -> &'static str {
        "vmdk-sparse"
    }

    fn probe(&self, dev: &dyn DiskBackend) -> Result<bool> {
        let mut magic = [0_u8; 4];
        if read_clamped(dev, 0, &mut magic)? < magic.len() {
            return Ok(false);
        }
        Ok(u32::from_le_bytes(magic) == SPARSE_MAGIC)
    }

    fn open(
        &self,
        lower: Arc<dyn DiskBackend>,
        ctx: &mut FormatContext,
    ) -> Result<Arc<dyn DiskBackend>> {
        let extent = SparseExtent::open(lower, ctx.parent.take(), ctx.mode.is_writable(), &ctx.disk_name)?;
        Ok(Arc::new(extent))
    }
}

/// Open sparse extent.
#[derive(Debug)]
pub struct SparseExtent {
    name: String,
    lower: Arc<dyn DiskBackend>,
    parent: Mutex<Option<Arc<dyn DiskBackend>>>,
    header: SparseHeader,
    grain_dir: Vec<u32>,
    redundant_dir: Vec<u32>,
    tables: Mutex<LruCache<u64, Arc<Vec<u32>>>>,
    last_grain: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
    /// Next free sector; computed once on first allocation.
    next_free: Mutex<Option<u64>>,
    writable: bool,
    closed: AtomicBool,
}

fn parse_error(disk: &str, err: &ParseError) -> VmsError {
    parse_error_to_vms(format!("{disk} sparse extent"), err)
}

impl SparseExtent {
    pub fn open(
        lower: Arc<dyn DiskBackend>,
        parent: Option<Arc<dyn DiskBackend>>,
        writable: bool,
        name: &str,
    ) -> Result<Self> {
        let mut sector = [0_u8; 512];
        lower.read_exact_at(0, &mut sector)?;
        let mut header = SparseHeader::parse(&sector).map_err(|e| parse_error(name, &e))?;

        if header.gd_offset == GD_AT_END {
            let footer_at = lower.len_bytes().checked_sub(1024).ok_or_else(|| {
                VmsError::corruption(name, "grain directory at end but extent too small for footer")
            })?;
            lower.read_exact_at(footer_at, &mut sector)?;
            header = SparseHeader::parse(&sector).map_err(|e| parse_error(name, &e))?;
            debug!(disk = name, footer_at, "sparse header taken from footer");
        }
        if header.has_markers() {
            return Err(VmsError::UnsupportedFeature(format!(
                "{name}: stream-optimized sparse extent (embedded markers)"
            )));
        }
        header.validate(name)?;
        if header.is_compressed() && header.compress_algorithm != COMPRESSION_DEFLATE {
            return Err(VmsError::UnsupportedFeature(format!(
                "{name}: grain compression algorithm {}",
                header.compress_algorithm
            )));
        }

        let grain_dir = read_directory(lower.as_ref(), header.gd_offset, header.gde_count(), name)?;
        let redundant_dir = if header.flags & FLAG_REDUNDANT_GRAIN_TABLE != 0 && header.rgd_offset != 0 {
            read_directory(lower.as_ref(), header.rgd_offset, header.gde_count(), name)?
        } else {
            Vec::new()
        };

        debug!(
            disk = name,
            capacity = header.capacity,
            grain_size = header.grain_size,
            gdes = grain_dir.len(),
            compressed = header.is_compressed(),
            has_parent = parent.is_some(),
            "opened sparse extent"
        );
        Ok(Self {
            name: name.to_owned(),
            lower,
            parent: Mutex::new(parent),
            header,
            grain_dir,
            redundant_dir,
            tables: Mutex::new(LruCache::new(GRAIN_TABLE_CACHE)?),
            last_grain: Mutex::new(None),
            next_free: Mutex::new(None),
            writable,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VmsError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn grain_table(&self, gd_index: u64) -> Result<Option<Arc<Vec<u32>>>> {
        let Some(&gt_sector) = usize::try_from(gd_index).ok().and_then(|i| self.grain_dir.get(i)) else {
            return Ok(None);
        };
        if gt_sector == 0 {
            return Ok(None);
        }
        if let Some(table) = self.tables.lock().get_cloned(&gd_index) {
            return Ok(Some(table));
        }
        let table = Arc::new(read_u32_table(
            self.lower.as_ref(),
            u64::from(gt_sector) * SECTOR_SIZE,
            u64::from(self.header.num_gtes_per_gt),
        )?);
        self.tables.lock().insert(gd_index, Arc::clone(&table));
        Ok(Some(table))
    }

    /// Grain table entry for grain number `grain`.
    pub fn gte(&self, grain: u64) -> Result<u32> {
        let per_table = u64::from(self.header.num_gtes_per_gt);
        let Some(table) = self.grain_table(grain / per_table)? else {
            return Ok(GTE_UNALLOCATED);
        };
        Ok(usize::try_from(grain % per_table)
            .ok()
            .and_then(|i| table.get(i).copied())
            .unwrap_or(GTE_UNALLOCATED))
    }

    fn read_parent(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let parent = self.parent.lock().clone();
        match parent {
            Some(parent) => {
                let n = read_clamped(parent.as_ref(), pos, buf)?;
                buf[n..].fill(0);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    fn compressed_grain(&self, grain: u64, sector: u32) -> Result<Arc<Vec<u8>>> {
        if let Some((cached, data)) = self.last_grain.lock().as_ref() {
            if *cached == grain {
                return Ok(Arc::clone(data));
            }
        }
        let base = u64::from(sector) * SECTOR_SIZE;
        let mut head = [0_u8; COMPRESSED_GRAIN_HEADER];
        self.lower.read_exact_at(base, &mut head)?;
        let size = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
        let limit = self.header.grain_bytes() + SECTOR_SIZE;
        let len = match usize::try_from(size) {
            Ok(len) if u64::from(size) <= limit => len,
            _ => {
                return Err(VmsError::corruption(
                    format!("{} grain {grain}", self.name),
                    format!("compressed size {size} exceeds {limit} bytes"),
                ));
            }
        };
        let mut packed = vec![0_u8; len];
        self.lower
            .read_exact_at(base + COMPRESSED_GRAIN_HEADER as u64, &mut packed)?;
        let data = Arc::new(inflate_grain(&packed, self.header.grain_bytes(), &self.name)?);
        *self.last_grain.lock() = Some((grain, Arc::clone(&data)));
        Ok(data)
    }

    fn next_free_sector(&self) -> Result<u64> {
        let mut guard = self.next_free.lock();
        let next = match *guard {
            Some(next) => next,
            None => {
                let mut high = 0_u64;
                for gd_index in 0..self.grain_dir.len() as u64 {
                    if let Some(table) = self.grain_table(gd_index)? {
                        for &gte in table.iter() {
                            if gte > GTE_ZEROED {
                                high = high.max(u64::from(gte));
                            }
                        }
                    }
                }
                let after_data = if high == 0 { 0 } else { high + self.header.grain_size };
                let end_of_file = self.lower.len_bytes().div_ceil(SECTOR_SIZE);
                let next = after_data.max(self.header.overhead).max(end_of_file);
                trace!(disk = %self.name, high, next, "computed sparse high-water mark");
                next
            }
        };
        let limit = self.header.overhead + self.header.grain_count() * self.header.grain_size;
        if next + self.header.grain_size > limit {
            return Err(VmsError::ResourceExhausted(format!(
                "{}: disk full allocating grain at sector {next} (limit {limit})",
                self.name
            )));
        }
        *guard = Some(next + self.header.grain_size);
        Ok(next)
    }

    fn write_gte(&self, grain: u64, value: u32) -> Result<()> {
        let per_table = u64::from(self.header.num_gtes_per_gt);
        let gd_index = grain / per_table;
        let slot = grain % per_table;
        let dirs = [&self.grain_dir, &self.redundant_dir];
        let mut wrote = false;
        for dir in dirs {
            let Some(&gt_sector) = usize::try_from(gd_index).ok().and_then(|i| dir.get(i)) else {
                continue;
            };
            if gt_sector == 0 {
                continue;
            }
            let at = u64::from(gt_sector) * SECTOR_SIZE + slot * 4;
            self.lower.write_all_at(at, &value.to_le_bytes())?;
            wrote = true;
        }
        if !wrote {
            return Err(VmsError::UnsupportedFeature(format!(
                "{}: grain table allocation for directory entry {gd_index}",
                self.name
            )));
        }
        let _ = self.tables.lock().remove(&gd_index);
        Ok(())
    }

    fn allocate_grain(&self, grain: u64, gte: u32) -> Result<u32> {
        let sector = self.next_free_sector()?;
        let sector32 = u32::try_from(sector).map_err(|_| {
            VmsError::ResourceExhausted(format!("{}: grain sector {sector} beyond u32", self.name))
        })?;
        let grain_bytes = self.header.grain_bytes();
        let mut data = vec![0_u8; grain_bytes as usize];
        if gte == GTE_UNALLOCATED {
            self.read_parent(grain * grain_bytes, &mut data)?;
        }
        self.lower.write_all_at(sector * SECTOR_SIZE, &data)?;
        self.write_gte(grain, sector32)?;
        debug!(disk = %self.name, grain, sector, "allocated grain");
        Ok(sector32)
    }
}

fn read_u32_table(dev: &dyn DiskBackend, offset: u64, count: u64) -> Result<Vec<u32>> {
    let mut raw = vec![0_u8; count as usize * 4];
    dev.read_exact_at(offset, &mut raw)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_directory(dev: &dyn DiskBackend, sector: u64, count: u64, disk: &str) -> Result<Vec<u32>> {
    if sector == 0 || sector == GD_AT_END {
        return Err(VmsError::corruption(
            format!("{disk} sparse header"),
            format!("invalid grain directory sector {sector:#x}"),
        ));
    }
    read_u32_table(dev, sector * SECTOR_SIZE, count)
}

/// Decompress one grain. zlib-wrapped streams are detected by their header;
/// anything else is treated as raw deflate.
pub fn inflate_grain(packed: &[u8], grain_bytes: u64, disk: &str) -> Result<Vec<u8>> {
    let zlib = packed.len() >= 2
        && packed[0] & 0x0F == 8
        && (u16::from(packed[0]) << 8 | u16::from(packed[1])) % 31 == 0;
    let mut out = Vec::with_capacity(grain_bytes as usize);
    let res = if zlib {
        ZlibDecoder::new(packed).take(grain_bytes).read_to_end(&mut out)
    } else {
        DeflateDecoder::new(packed).take(grain_bytes).read_to_end(&mut out)
    };
    res.map_err(|e| VmsError::corruption(format!("{disk} compressed grain"), e.to_string()))?;
    out.resize(grain_bytes as usize, 0);
    Ok(out)
}

impl DiskBackend for SparseExtent {
    fn kind(&self) -> &'static str {
        "vmdk-sparse"
    }

    fn len_bytes(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        check_range("vmdk-sparse", offset, buf.len(), self.len_bytes())?;
        let grain_bytes = self.header.grain_bytes();
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let grain = pos / grain_bytes;
            let within = pos % grain_bytes;
            let n = ((grain_bytes - within) as usize).min(buf.len() - done);
            let out = &mut buf[done..done + n];
            match self.gte(grain)? {
                GTE_UNALLOCATED => self.read_parent(pos, out)?,
                GTE_ZEROED => out.fill(0),
                sector if self.header.is_compressed() => {
                    let data = self.compressed_grain(grain, sector)?;
                    let start = within as usize;
                    out.copy_from_slice(&data[start..start + n]);
                }
                sector => {
                    self.lower
                        .read_exact_at(u64::from(sector) * SECTOR_SIZE + within, out)?;
                }
            }
            done += n;
        }
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.writable {
            return Err(VmsError::ReadOnly);
        }
        if self.header.is_compressed() {
            return Err(VmsError::unsupported_op("write", format!("compressed sparse extent {}", self.name)));
        }
        check_range("vmdk-sparse", offset, buf.len(), self.len_bytes())?;
        let grain_bytes = self.header.grain_bytes();
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let grain = pos / grain_bytes;
            let within = pos % grain_bytes;
            let n = ((grain_bytes - within) as usize).min(buf.len() - done);
            let sector = match self.gte(grain)? {
                gte @ (GTE_UNALLOCATED | GTE_ZEROED) => self.allocate_grain(grain, gte)?,
                sector => sector,
            };
            self.lower
                .write_all_at(u64::from(sector) * SECTOR_SIZE + within, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable && !self.header.is_compressed()
    }

    fn sync(&self) -> Result<()> {
        self.lower.sync()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tables.lock().clear();
        *self.last_grain.lock() = None;
        self.lower.close()?;
        if let Some(parent) = self.parent.lock().take() {
            parent.close()?;
        }
        debug!(disk = %self.name, "closed sparse extent");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn parent(&self) -> Option<Arc<dyn DiskBackend>> {
        self.parent.lock().clone()
    }

    fn take_parent(&self) -> Option<Arc<dyn DiskBackend>> {
        self.parent.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(grain_size: u64, capacity: u64) -> SparseHeader {
        SparseHeader {
            version: 1,
            flags: FLAG_VALID_NEWLINE_TEST | FLAG_REDUNDANT_GRAIN_TABLE,
            capacity,
            grain_size,
            descriptor_offset: 1,
            descriptor_size: 20,
            num_gtes_per_gt: 512,
            rgd_offset: 21,
            gd_offset: 100,
            overhead: 200,
            compress_algorithm: COMPRESSION_NONE,
        }
    }

    #[test]
    fn header_survives_sector_encoding() {
        let h = header(128, 1 << 20);
        let sector = h.to_sector().expect("encode");
        assert_eq!(&sector[0..4], b"KDMV");
        assert_eq!(SparseHeader::parse(&sector).expect("parse"), h);
    }

    #[test]
    fn wrong_magic_is_a_parse_error() {
        let mut sector = header(128, 2048).to_sector().expect("encode");
        sector[0] = b'X';
        assert!(matches!(
            SparseHeader::parse(&sector),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn directory_geometry() {
        let h = header(128, 128 * 512 * 3 + 1);
        assert_eq!(h.grain_bytes(), 65_536);
        assert_eq!(h.grain_count(), 512 * 3 + 1);
        assert_eq!(h.gde_count(), 4);
    }

    #[test]
    fn validation_rejects_bad_grain_sizes() {
        assert!(header(128, 2048).validate("d").is_ok());
        assert!(header(4, 2048).validate("d").is_err());
        assert!(header(24, 2048).validate("d").is_err());
        let mut zero = header(128, 2048);
        zero.num_gtes_per_gt = 0;
        assert!(zero.validate("d").is_err());
    }

    #[test]
    fn flags_follow_vmdk_bit_layout() {
        let mut h = header(128, 2048);
        h.flags = FLAG_COMPRESSED;
        assert!(h.is_compressed());
        assert!(!h.has_markers());
        h.flags |= FLAG_MARKERS;
        assert!(h.has_markers());
    }

    #[test]
    fn inflate_handles_zlib_and_raw_deflate() {
        use flate2::Compression;
        use flate2::write::{DeflateEncoder, ZlibEncoder};
        use std::io::Write;

        let plain = vec![0xA5_u8; 4096];
        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        z.write_all(&plain).expect("zlib");
        let zlib = z.finish().expect("finish");
        assert_eq!(inflate_grain(&zlib, 4096, "d").expect("inflate"), plain);

        let mut d = DeflateEncoder::new(Vec::new(), Compression::default());
        d.write_all(&plain[..1000]).expect("deflate");
        let raw = d.finish().expect("finish");
        let out = inflate_grain(&raw, 4096, "d").expect("inflate");
        assert_eq!(&out[..1000], &plain[..1000]);
        assert!(out[1000..].iter().all(|b| *b == 0));

        assert!(inflate_grain(&[0x78, 0x9C, 0xFF, 0xFF], 4096, "d").is_err());
    }
}
