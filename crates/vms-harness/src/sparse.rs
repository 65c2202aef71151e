//! VMware hosted sparse extents and VHD images.

use crate::{SECTOR, place, put_be, put_le};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

const VMDK_FLAG_NEWLINE: u32 = 1 << 0;
const VMDK_FLAG_REDUNDANT: u32 = 1 << 1;
const VMDK_FLAG_COMPRESSED: u32 = 1 << 16;
const VMDK_FLAG_MARKERS: u32 = 1 << 17;

/// Builder for a hosted sparse extent.
///
/// Layout: header, redundant directory and tables, primary directory and
/// tables, then grains in ascending grain order starting at `overhead`.
#[derive(Debug, Clone)]
pub struct SparseExtentBuilder {
    capacity_sectors: u64,
    grain_size: u64,
    gtes_per_gt: u32,
    compressed: bool,
    markers: bool,
    footer: bool,
    grains: BTreeMap<u64, Vec<u8>>,
    zeroed: BTreeSet<u64>,
    file_sectors: Option<u64>,
}

/// Result of [`SparseExtentBuilder::build`].
#[derive(Debug, Clone)]
pub struct SparseExtentImage {
    pub bytes: Vec<u8>,
    pub overhead: u64,
    pub gd_offset: u64,
    pub rgd_offset: u64,
    pub grain_count: u64,
}

impl SparseExtentBuilder {
    #[must_use]
    pub fn new(capacity_sectors: u64, grain_size: u64) -> Self {
        Self {
            capacity_sectors,
            grain_size,
            gtes_per_gt: 512,
            compressed: false,
            markers: false,
            footer: false,
            grains: BTreeMap::new(),
            zeroed: BTreeSet::new(),
            file_sectors: None,
        }
    }

    #[must_use]
    pub fn gtes_per_table(mut self, n: u32) -> Self {
        self.gtes_per_gt = n;
        self
    }

    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Mark the extent stream-optimized (embedded markers).
    #[must_use]
    pub fn with_markers(mut self) -> Self {
        self.markers = true;
        self
    }

    /// Put the grain directory behind a footer (`gd_offset` = `GD_AT_END`).
    #[must_use]
    pub fn with_footer(mut self) -> Self {
        self.footer = true;
        self
    }

    /// Allocate `grain` with `data` (padded with zeros to a full grain).
    #[must_use]
    pub fn grain(mut self, grain: u64, data: &[u8]) -> Self {
        self.grains.insert(grain, data.to_vec());
        self
    }

    /// Set the GTE of `grain` to the explicit-zero marker.
    #[must_use]
    pub fn zeroed_grain(mut self, grain: u64) -> Self {
        self.zeroed.insert(grain);
        self
    }

    /// Pad the extent file to `sectors` sectors.
    #[must_use]
    pub fn file_sectors(mut self, sectors: u64) -> Self {
        self.file_sectors = Some(sectors);
        self
    }

    fn header(&self, gd_offset: u64, rgd_offset: u64, overhead: u64) -> Vec<u8> {
        let mut flags = VMDK_FLAG_NEWLINE | VMDK_FLAG_REDUNDANT;
        if self.compressed {
            flags |= VMDK_FLAG_COMPRESSED;
        }
        if self.markers {
            flags |= VMDK_FLAG_MARKERS;
        }
        let mut h = vec![0_u8; SECTOR];
        h[0..4].copy_from_slice(b"KDMV");
        put_le(&mut h, 4, if self.compressed { 3 } else { 1 }, 4);
        put_le(&mut h, 8, u64::from(flags), 4);
        put_le(&mut h, 12, self.capacity_sectors, 8);
        put_le(&mut h, 20, self.grain_size, 8);
        put_le(&mut h, 44, u64::from(self.gtes_per_gt), 4);
        put_le(&mut h, 48, rgd_offset, 8);
        put_le(&mut h, 56, gd_offset, 8);
        put_le(&mut h, 64, overhead, 8);
        h[73] = b'\n';
        h[74] = b' ';
        h[75] = b'\r';
        h[76] = b'\n';
        put_le(&mut h, 77, u64::from(self.compressed), 2);
        h
    }

    #[must_use]
    pub fn build(&self) -> SparseExtentImage {
        let grain_count = self.capacity_sectors.div_ceil(self.grain_size);
        let per_gt = u64::from(self.gtes_per_gt);
        let gde_count = grain_count.div_ceil(per_gt);
        let gd_sectors = (gde_count * 4).div_ceil(SECTOR as u64);
        let gt_sectors = (per_gt * 4).div_ceil(SECTOR as u64);

        let rgd_offset = 1;
        let rgt_start = rgd_offset + gd_sectors;
        let gd_offset = rgt_start + gde_count * gt_sectors;
        let gt_start = gd_offset + gd_sectors;
        let meta_end = gt_start + gde_count * gt_sectors;
        let overhead = meta_end.div_ceil(self.grain_size) * self.grain_size;

        let mut gtes = vec![0_u32; (gde_count * per_gt) as usize];
        for &g in &self.zeroed {
            gtes[g as usize] = 1;
        }
        let grain_bytes = (self.grain_size as usize) * SECTOR;
        let mut bytes = vec![0_u8; overhead as usize * SECTOR];
        let mut next = overhead;
        for (&g, data) in &self.grains {
            gtes[g as usize] = next as u32;
            let at = next as usize * SECTOR;
            if self.compressed {
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                let mut full = data.clone();
                full.resize(grain_bytes, 0);
                enc.write_all(&full).expect("compress grain");
                let packed = enc.finish().expect("finish grain");
                let mut record = vec![0_u8; 12];
                put_le(&mut record, 0, g * self.grain_size, 8);
                put_le(&mut record, 8, packed.len() as u64, 4);
                record.extend_from_slice(&packed);
                let used = record.len().div_ceil(SECTOR);
                place(&mut bytes, at, &record);
                bytes.resize((at / SECTOR + used) * SECTOR, 0);
                next += used as u64;
            } else {
                let mut full = data.clone();
                full.resize(grain_bytes, 0);
                place(&mut bytes, at, &full);
                next += self.grain_size;
            }
        }

        for (dir, tables) in [(rgd_offset, rgt_start), (gd_offset, gt_start)] {
            for i in 0..gde_count {
                let table_sector = tables + i * gt_sectors;
                put_le(&mut bytes, dir as usize * SECTOR + i as usize * 4, table_sector, 4);
                for j in 0..per_gt {
                    let gte = gtes[(i * per_gt + j) as usize];
                    put_le(
                        &mut bytes,
                        table_sector as usize * SECTOR + j as usize * 4,
                        u64::from(gte),
                        4,
                    );
                }
            }
        }

        let header_gd = if self.footer { u64::MAX } else { gd_offset };
        place(&mut bytes, 0, &self.header(header_gd, rgd_offset, overhead));
        if let Some(sectors) = self.file_sectors {
            if bytes.len() < sectors as usize * SECTOR {
                bytes.resize(sectors as usize * SECTOR, 0);
            }
        }
        if self.footer {
            // Footer marker sector, footer header, end-of-stream sector.
            let footer = self.header(gd_offset, rgd_offset, overhead);
            bytes.extend_from_slice(&footer);
            bytes.extend_from_slice(&[0_u8; SECTOR]);
        }

        SparseExtentImage {
            bytes,
            overhead,
            gd_offset,
            rgd_offset,
            grain_count,
        }
    }
}

pub const VHD_FIXED: u32 = 2;
pub const VHD_DYNAMIC: u32 = 3;
pub const VHD_DIFFERENCING: u32 = 4;

fn vhd_checksum(bytes: &[u8], skip: usize) -> u32 {
    let mut sum = 0_u32;
    for (i, b) in bytes.iter().enumerate() {
        if !(skip..skip + 4).contains(&i) {
            sum = sum.wrapping_add(u32::from(*b));
        }
    }
    !sum
}

/// 512-byte VHD footer.
#[must_use]
pub fn vhd_footer(disk_type: u32, size: u64, data_offset: u64) -> Vec<u8> {
    let mut f = vec![0_u8; SECTOR];
    f[0..8].copy_from_slice(b"conectix");
    put_be(&mut f, 8, 2, 4);
    put_be(&mut f, 12, 0x0001_0000, 4);
    put_be(&mut f, 16, data_offset, 8);
    f[28..32].copy_from_slice(b"test");
    put_be(&mut f, 40, size, 8);
    put_be(&mut f, 48, size, 8);
    put_be(&mut f, 60, u64::from(disk_type), 4);
    let sum = vhd_checksum(&f, 64);
    put_be(&mut f, 64, u64::from(sum), 4);
    f
}

/// Fixed VHD: the data followed by the footer.
#[must_use]
pub fn vhd_fixed(data: &[u8]) -> Vec<u8> {
    let mut image = data.to_vec();
    image.extend(vhd_footer(VHD_FIXED, data.len() as u64, u64::MAX));
    image
}

/// Builder for dynamic and differencing VHDs.
#[derive(Debug, Clone)]
pub struct VhdBuilder {
    size: u64,
    block_size: u32,
    differencing: bool,
    /// Block number to (data, sectors whose bitmap bit is set).
    blocks: BTreeMap<u64, (Vec<u8>, Vec<u64>)>,
}

impl VhdBuilder {
    #[must_use]
    pub fn dynamic(size: u64, block_size: u32) -> Self {
        Self {
            size,
            block_size,
            differencing: false,
            blocks: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn differencing(size: u64, block_size: u32) -> Self {
        Self {
            differencing: true,
            ..Self::dynamic(size, block_size)
        }
    }

    /// Allocate `block` with `data`; every sector is marked present.
    #[must_use]
    pub fn block(mut self, block: u64, data: &[u8]) -> Self {
        let sectors = (0..u64::from(self.block_size) / SECTOR as u64).collect();
        self.blocks.insert(block, (data.to_vec(), sectors));
        self
    }

    /// Allocate `block` with `data` but mark only `sectors` present.
    #[must_use]
    pub fn partial_block(mut self, block: u64, data: &[u8], sectors: &[u64]) -> Self {
        self.blocks.insert(block, (data.to_vec(), sectors.to_vec()));
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let blocks = self.size.div_ceil(u64::from(self.block_size));
        let bat_offset = 1536_u64;
        let bat_bytes = (blocks * 4).div_ceil(SECTOR as u64) * SECTOR as u64;
        let sectors_per_block = u64::from(self.block_size) / SECTOR as u64;
        let bitmap_bytes = sectors_per_block.div_ceil(8).div_ceil(SECTOR as u64) * SECTOR as u64;
        let disk_type = if self.differencing { VHD_DIFFERENCING } else { VHD_DYNAMIC };

        let footer = vhd_footer(disk_type, self.size, SECTOR as u64);
        let mut image = footer.clone();

        let mut header = vec![0_u8; 1024];
        header[0..8].copy_from_slice(b"cxsparse");
        put_be(&mut header, 8, u64::MAX, 8);
        put_be(&mut header, 16, bat_offset, 8);
        put_be(&mut header, 24, 0x0001_0000, 4);
        put_be(&mut header, 28, blocks, 4);
        put_be(&mut header, 32, u64::from(self.block_size), 4);
        if self.differencing {
            for (i, unit) in "parent.vhd".encode_utf16().enumerate() {
                put_be(&mut header, 64 + i * 2, u64::from(unit), 2);
            }
        }
        let sum = vhd_checksum(&header, 36);
        put_be(&mut header, 36, u64::from(sum), 4);
        place(&mut image, SECTOR, &header);

        let mut bat = vec![0xFF_u8; bat_bytes as usize];
        let mut next = bat_offset + bat_bytes;
        for (&block, (data, present)) in &self.blocks {
            put_be(&mut bat, block as usize * 4, next / SECTOR as u64, 4);
            let mut bitmap = vec![0_u8; bitmap_bytes as usize];
            for &s in present {
                bitmap[(s / 8) as usize] |= 0x80 >> (s % 8);
            }
            place(&mut image, next as usize, &bitmap);
            let mut full = data.clone();
            full.resize(self.block_size as usize, 0);
            place(&mut image, (next + bitmap_bytes) as usize, &full);
            next += bitmap_bytes + u64::from(self.block_size);
        }
        place(&mut image, bat_offset as usize, &bat);
        image.resize(next as usize, 0);
        image.extend(footer);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_layout_puts_grains_after_overhead() {
        let img = SparseExtentBuilder::new(1024, 16).grain(3, &[7; 16]).build();
        assert_eq!(&img.bytes[0..4], b"KDMV");
        assert_eq!(img.grain_count, 64);
        assert_eq!(img.overhead % 16, 0);
        let at = img.overhead as usize * SECTOR;
        assert_eq!(&img.bytes[at..at + 16], &[7; 16]);
    }

    #[test]
    fn vhd_footer_checksum_verifies() {
        let f = vhd_footer(VHD_FIXED, 4096, u64::MAX);
        let stored = u32::from_be_bytes([f[64], f[65], f[66], f[67]]);
        assert_eq!(stored, vhd_checksum(&f, 64));
    }

    #[test]
    fn dynamic_vhd_ends_with_footer() {
        let image = VhdBuilder::dynamic(8192, 4096).block(1, &[1; 4096]).build();
        assert_eq!(&image[image.len() - 512..image.len() - 504], b"conectix");
        assert_eq!(&image[512..520], b"cxsparse");
    }
}
