//! Microsoft VHD: fixed, dynamic and differencing disks.
//!
//! Every VHD ends with a 512-byte big-endian footer (cookie `conectix`).
//! Fixed disks are flat data followed by the footer. Dynamic and
//! differencing disks add a header (cookie `cxsparse`) and a block
//! allocation table (BAT); each allocated block starts with a sector bitmap.
//! Differencing disks consult the bitmap and read clear sectors from the
//! parent.

use crate::probe::{DiskFormat, FormatContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use vms_block::{DiskBackend, LruCache, WindowBackend, check_range, read_clamped};
use vms_error::{Result, VmsError};
use vms_types::codec::{FieldType, Record, Schema};
use vms_types::{ParseError, SECTOR_SIZE, parse_error_to_vms, utf16le_to_string};

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DYNAMIC_COOKIE: &[u8; 8] = b"cxsparse";
pub const FOOTER_SIZE: u64 = 512;
pub const BAT_UNUSED: u32 = 0xFFFF_FFFF;

pub const DISK_TYPE_FIXED: u32 = 2;
pub const DISK_TYPE_DYNAMIC: u32 = 3;
pub const DISK_TYPE_DIFFERENCING: u32 = 4;

const BITMAP_CACHE: usize = 64;

pub const VHD_FOOTER: Schema = Schema::new(&[
    ("cookie", FieldType::Bytes(8)),
    ("features", FieldType::U32Be),
    ("format_version", FieldType::U32Be),
    ("data_offset", FieldType::U64Be),
    ("timestamp", FieldType::U32Be),
    ("creator_app", FieldType::Bytes(4)),
    ("creator_version", FieldType::U32Be),
    ("creator_host_os", FieldType::Bytes(4)),
    ("original_size", FieldType::U64Be),
    ("current_size", FieldType::U64Be),
    ("geometry", FieldType::U32Be),
    ("disk_type", FieldType::U32Be),
    ("checksum", FieldType::U32Be),
    ("unique_id", FieldType::Bytes(16)),
    ("saved_state", FieldType::U8),
]);

pub const VHD_DYNAMIC_HEADER: Schema = Schema::new(&[
    ("cookie", FieldType::Bytes(8)),
    ("data_offset", FieldType::U64Be),
    ("table_offset", FieldType::U64Be),
    ("header_version", FieldType::U32Be),
    ("max_table_entries", FieldType::U32Be),
    ("block_size", FieldType::U32Be),
    ("checksum", FieldType::U32Be),
    ("parent_unique_id", FieldType::Bytes(16)),
    ("parent_timestamp", FieldType::U32Be),
    ("reserved", FieldType::U32Be),
    ("parent_name", FieldType::Bytes(512)),
]);

const FOOTER_CHECKSUM_OFFSET: usize = 64;
const DYNAMIC_CHECKSUM_OFFSET: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdFooter {
    pub data_offset: u64,
    pub current_size: u64,
    pub disk_type: u32,
    pub checksum: u32,
}

impl VhdFooter {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = VHD_FOOTER.decode(bytes)?;
        if record.bytes("cookie")? != FOOTER_COOKIE {
            return Err(ParseError::InvalidField {
                field: "cookie",
                reason: "expected conectix",
            });
        }
        Ok(Self {
            data_offset: record.uint("data_offset")?,
            current_size: record.uint("current_size")?,
            disk_type: u32::try_from(record.uint("disk_type")?)
                .map_err(|_| ParseError::IntegerConversion { field: "disk_type" })?,
            checksum: u32::try_from(record.uint("checksum")?)
                .map_err(|_| ParseError::IntegerConversion { field: "checksum" })?,
        })
    }

    /// Encode a 512-byte footer with a valid checksum.
    pub fn to_sector(&self) -> Result<Vec<u8>, ParseError> {
        let mut record = Record::new();
        record
            .set_bytes("cookie", FOOTER_COOKIE)
            .set_uint("features", 2)
            .set_uint("format_version", 0x0001_0000)
            .set_uint("data_offset", self.data_offset)
            .set_bytes("creator_app", b"vms ")
            .set_uint("original_size", self.current_size)
            .set_uint("current_size", self.current_size)
            .set_uint("disk_type", u64::from(self.disk_type));
        let mut sector = vec![0_u8; FOOTER_SIZE as usize];
        VHD_FOOTER.encode_into(&record, &mut sector)?;
        let sum = vhd_checksum(&sector, FOOTER_CHECKSUM_OFFSET);
        sector[FOOTER_CHECKSUM_OFFSET..FOOTER_CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_be_bytes());
        Ok(sector)
    }
}

/// One's complement of the byte sum, skipping the checksum field.
#[must_use]
pub fn vhd_checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let sum = bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| !(checksum_offset..checksum_offset + 4).contains(i))
        .fold(0_u32, |acc, (_, b)| acc.wrapping_add(u32::from(*b)));
    !sum
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdDynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_name: String,
}

impl VhdDynamicHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = VHD_DYNAMIC_HEADER.decode(bytes)?;
        if record.bytes("cookie")? != DYNAMIC_COOKIE {
            return Err(ParseError::InvalidField {
                field: "cookie",
                reason: "expected cxsparse",
            });
        }
        let block_size = u32::try_from(record.uint("block_size")?)
            .map_err(|_| ParseError::IntegerConversion { field: "block_size" })?;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two >= 512",
            });
        }
        Ok(Self {
            table_offset: record.uint("table_offset")?,
            max_table_entries: u32::try_from(record.uint("max_table_entries")?)
                .map_err(|_| ParseError::IntegerConversion { field: "max_table_entries" })?,
            block_size,
            parent_name: utf16_be_name(record.bytes("parent_name")?),
        })
    }

    /// Encode the 1024-byte dynamic header with a valid checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut record = Record::new();
        record
            .set_bytes("cookie", DYNAMIC_COOKIE)
            .set_uint("data_offset", u64::MAX)
            .set_uint("table_offset", self.table_offset)
            .set_uint("header_version", 0x0001_0000)
            .set_uint("max_table_entries", u64::from(self.max_table_entries))
            .set_uint("block_size", u64::from(self.block_size));
        let mut name = Vec::with_capacity(512);
        for unit in self.parent_name.encode_utf16().take(256) {
            name.extend_from_slice(&unit.to_be_bytes());
        }
        record.set_bytes("parent_name", &name);
        let mut bytes = vec![0_u8; 1024];
        VHD_DYNAMIC_HEADER.encode_into(&record, &mut bytes)?;
        let sum = vhd_checksum(&bytes, DYNAMIC_CHECKSUM_OFFSET);
        bytes[DYNAMIC_CHECKSUM_OFFSET..DYNAMIC_CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_be_bytes());
        Ok(bytes)
    }

    /// Size of the per-block sector bitmap, padded to a sector.
    #[must_use]
    pub fn bitmap_bytes(&self) -> u64 {
        let sectors = u64::from(self.block_size) / SECTOR_SIZE;
        sectors.div_ceil(8).div_ceil(SECTOR_SIZE) * SECTOR_SIZE
    }
}

fn utf16_be_name(raw: &[u8]) -> String {
    let swapped: Vec<u8> = raw.chunks_exact(2).flat_map(|c| [c[1], c[0]]).collect();
    utf16le_to_string(&swapped)
}

#[derive(Debug, Clone, Copy)]
pub struct VhdFormat;

impl DiskFormat for VhdFormat {
    fn name(&self) -> &'static str {
        "vhd"
    }

    fn probe(&self, dev: &dyn DiskBackend) -> Result<bool> {
        let Some(at) = dev.len_bytes().checked_sub(FOOTER_SIZE) else {
            return Ok(false);
        };
        let mut cookie = [0_u8; 8];
        if read_clamped(dev, at, &mut cookie)? < cookie.len() {
            return Ok(false);
        }
        Ok(&cookie == FOOTER_COOKIE)
    }

    fn open(
        &self,
        lower: Arc<dyn DiskBackend>,
        ctx: &mut FormatContext,
    ) -> Result<Arc<dyn DiskBackend>> {
        let name = ctx.disk_name.clone();
        let footer_at = lower.len_bytes() - FOOTER_SIZE;
        let mut raw = vec![0_u8; FOOTER_SIZE as usize];
        lower.read_exact_at(footer_at, &mut raw)?;
        let footer = VhdFooter::parse(&raw)
            .map_err(|e| parse_error_to_vms(format!("{name} VHD footer"), &e))?;
        if vhd_checksum(&raw, FOOTER_CHECKSUM_OFFSET) != footer.checksum {
            warn!(disk = %name, "VHD footer checksum mismatch");
        }

        match footer.disk_type {
            DISK_TYPE_FIXED => {
                let len = footer.current_size.min(footer_at);
                debug!(disk = %name, len, "opened fixed VHD");
                Ok(Arc::new(WindowBackend::owning(lower, 0, len)?))
            }
            DISK_TYPE_DYNAMIC | DISK_TYPE_DIFFERENCING => {
                let parent = if footer.disk_type == DISK_TYPE_DIFFERENCING {
                    Some(ctx.parent.take().ok_or_else(|| {
                        VmsError::InvalidConfig(format!(
                            "{name}: differencing VHD opened without a parent disk"
                        ))
                    })?)
                } else {
                    None
                };
                let disk = VhdDynamic::open(lower, footer, parent, ctx.mode.is_writable(), &name)?;
                Ok(Arc::new(disk))
            }
            other => Err(VmsError::UnsupportedFeature(format!(
                "{name}: VHD disk type {other}"
            ))),
        }
    }
}

/// Dynamic or differencing VHD.
#[derive(Debug)]
pub struct VhdDynamic {
    name: String,
    lower: Arc<dyn DiskBackend>,
    parent: Mutex<Option<Arc<dyn DiskBackend>>>,
    size: u64,
    header: VhdDynamicHeader,
    bat: Vec<u32>,
    differencing: bool,
    bitmaps: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
    writable: bool,
    closed: AtomicBool,
}

impl VhdDynamic {
    pub fn open(
        lower: Arc<dyn DiskBackend>,
        footer: VhdFooter,
        parent: Option<Arc<dyn DiskBackend>>,
        writable: bool,
        name: &str,
    ) -> Result<Self> {
        let mut raw = vec![0_u8; 1024];
        lower.read_exact_at(footer.data_offset, &mut raw)?;
        let header = VhdDynamicHeader::parse(&raw)
            .map_err(|e| parse_error_to_vms(format!("{name} VHD dynamic header"), &e))?;
        let blocks = footer.current_size.div_ceil(u64::from(header.block_size));
        if u64::from(header.max_table_entries) < blocks {
            return Err(VmsError::corruption(
                format!("{name} VHD dynamic header"),
                format!(
                    "BAT has {} entries but {blocks} blocks are needed",
                    header.max_table_entries
                ),
            ));
        }
        let mut bat_raw = vec![0_u8; header.max_table_entries as usize * 4];
        lower.read_exact_at(header.table_offset, &mut bat_raw)?;
        let bat = bat_raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        debug!(
            disk = name,
            size = footer.current_size,
            block_size = header.block_size,
            differencing = parent.is_some(),
            parent_name = %header.parent_name,
            "opened dynamic VHD"
        );
        Ok(Self {
            name: name.to_owned(),
            lower,
            differencing: parent.is_some(),
            parent: Mutex::new(parent),
            size: footer.current_size,
            header,
            bat,
            bitmaps: Mutex::new(LruCache::new(BITMAP_CACHE)?),
            writable,
            closed: AtomicBool::new(false),
        })
    }

    fn block_sector(&self, block: u64) -> Option<u64> {
        let entry = *self.bat.get(usize::try_from(block).ok()?)?;
        (entry != BAT_UNUSED).then_some(u64::from(entry))
    }

    fn bitmap(&self, block: u64, block_sector: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(bitmap) = self.bitmaps.lock().get_cloned(&block) {
            return Ok(bitmap);
        }
        let mut raw = vec![0_u8; self.header.bitmap_bytes() as usize];
        self.lower.read_exact_at(block_sector * SECTOR_SIZE, &mut raw)?;
        let bitmap = Arc::new(raw);
        self.bitmaps.lock().insert(block, Arc::clone(&bitmap));
        Ok(bitmap)
    }

    fn read_parent(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        match self.parent.lock().clone() {
            Some(parent) => {
                let n = read_clamped(parent.as_ref(), pos, buf)?;
                buf[n..].fill(0);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    fn data_offset(&self, block_sector: u64, within: u64) -> u64 {
        block_sector * SECTOR_SIZE + self.header.bitmap_bytes() + within
    }
}

fn bit_set(bitmap: &[u8], sector: u64) -> bool {
    usize::try_from(sector / 8)
        .ok()
        .and_then(|i| bitmap.get(i))
        .is_some_and(|byte| byte & (0x80 >> (sector % 8)) != 0)
}

impl DiskBackend for VhdDynamic {
    fn kind(&self) -> &'static str {
        if self.differencing { "vhd-differencing" } else { "vhd-dynamic" }
    }

    fn len_bytes(&self) -> u64 {
        self.size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VmsError::Closed(self.name.clone()));
        }
        check_range("vhd", offset, buf.len(), self.size)?;
        let block_bytes = u64::from(self.header.block_size);
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_bytes;
            let within = pos % block_bytes;
            // Differencing reads go sector by sector through the bitmap.
            let span = if self.differencing {
                SECTOR_SIZE - within % SECTOR_SIZE
            } else {
                block_bytes - within
            };
            let n = (span as usize).min(buf.len() - done);
            let out = &mut buf[done..done + n];
            match self.block_sector(block) {
                None if self.differencing => self.read_parent(pos, out)?,
                None => out.fill(0),
                Some(sector) if self.differencing => {
                    let bitmap = self.bitmap(block, sector)?;
                    if bit_set(&bitmap, within / SECTOR_SIZE) {
                        self.lower.read_exact_at(self.data_offset(sector, within), out)?;
                    } else {
                        self.read_parent(pos, out)?;
                    }
                }
                Some(sector) => self.lower.read_exact_at(self.data_offset(sector, within), out)?,
            }
            done += n;
        }
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VmsError::ReadOnly);
        }
        check_range("vhd", offset, buf.len(), self.size)?;
        let block_bytes = u64::from(self.header.block_size);
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block = pos / block_bytes;
            let within = pos % block_bytes;
            let n = ((block_bytes - within) as usize).min(buf.len() - done);
            let Some(sector) = self.block_sector(block) else {
                return Err(VmsError::unsupported_op(
                    "block allocation",
                    format!("dynamic VHD {}", self.name),
                ));
            };
            if self.differencing && (within % SECTOR_SIZE != 0 || n as u64 % SECTOR_SIZE != 0) {
                return Err(VmsError::unsupported_op(
                    "unaligned write",
                    format!("differencing VHD {}", self.name),
                ));
            }
            self.lower
                .write_all_at(self.data_offset(sector, within), &buf[done..done + n])?;
            if self.differencing {
                let mut bitmap = self.bitmap(block, sector)?.as_ref().clone();
                let first = within / SECTOR_SIZE;
                for s in first..first + n as u64 / SECTOR_SIZE {
                    bitmap[(s / 8) as usize] |= 0x80 >> (s % 8);
                }
                self.lower.write_all_at(sector * SECTOR_SIZE, &bitmap)?;
                self.bitmaps.lock().insert(block, Arc::new(bitmap));
            }
            done += n;
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn sync(&self) -> Result<()> {
        self.lower.sync()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.bitmaps.lock().clear();
        self.lower.close()?;
        if let Some(parent) = self.parent.lock().take() {
            parent.close()?;
        }
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

/// Read the raw footer of a VHD backend, if present.
pub fn read_footer(dev: &dyn DiskBackend) -> Result<Option<VhdFooter>> {
    let Some(at) = dev.len_bytes().checked_sub(FOOTER_SIZE) else {
        return Ok(None);
    };
    let mut raw = vec![0_u8; FOOTER_SIZE as usize];
    dev.read_exact_at(at, &mut raw)?;
    Ok(VhdFooter::parse(&raw).ok())
}
