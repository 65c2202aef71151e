//! Thin provisioning: pool metadata decoding and device address translation.
//!
//! The pool metadata volume holds a superblock (block 0), two space maps,
//! a device-details tree keyed by device id, and a two-level mapping tree:
//! the top level maps a device id to the root of that device's block tree,
//! whose leaves map a virtual block to `(data_block << 24) | time`.

pub mod btree;
pub mod space_map;
pub mod superblock;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};
use vms_block::DiskBackend;
use vms_error::{Result, VmsError};
use vms_types::{parse_error_to_vms, read_le_u32, read_le_u64};

pub use btree::{BtreeNode, MetadataReader};
pub use space_map::{IndexEntry, SpaceMap, SpaceMapKind};
pub use superblock::{SpaceMapRoot, THIN_MAGIC, ThinSuperblock};

/// Low bits of a mapping value carry the snapshot time.
const TIME_BITS: u32 = 24;

/// Decoded leaf value of a device block tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapping {
    pub data_block: u64,
    pub time: u32,
}

impl BlockMapping {
    #[must_use]
    pub fn unpack(value: u64) -> Self {
        Self {
            data_block: value >> TIME_BITS,
            time: (value & ((1 << TIME_BITS) - 1)) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceDetails {
    pub mapped_blocks: u64,
    pub transaction_id: u64,
    pub creation_time: u32,
    pub snapshotted_time: u32,
}

impl DeviceDetails {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let parse = || -> std::result::Result<Self, vms_types::ParseError> {
            Ok(Self {
                mapped_blocks: read_le_u64(bytes, 0)?,
                transaction_id: read_le_u64(bytes, 8)?,
                creation_time: read_le_u32(bytes, 16)?,
                snapshotted_time: read_le_u32(bytes, 20)?,
            })
        };
        parse().map_err(|err| parse_error_to_vms("thin device details", &err))
    }
}

/// One device block of a translated range.
///
/// `data_block` and `start` are `None` for unprovisioned blocks, which read
/// as zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub device_block: u64,
    pub data_block: Option<u64>,
    /// Byte address on the data volume.
    pub start: Option<u64>,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThinPoolStats {
    pub data_block_size: u64,
    pub data_blocks: u64,
    pub data_allocated: u64,
    pub metadata_blocks: u64,
    pub metadata_allocated: u64,
}

/// An opened thin pool: metadata and data volumes plus the decoded
/// superblock.
#[derive(Debug)]
pub struct ThinPool {
    name: String,
    reader: MetadataReader,
    data: Arc<dyn DiskBackend>,
    superblock: ThinSuperblock,
    device_roots: Mutex<HashMap<u64, Option<u64>>>,
}

impl ThinPool {
    /// Read the superblock from `metadata` and bind the pool to `data`.
    pub fn open(
        name: impl Into<String>,
        metadata: Arc<dyn DiskBackend>,
        data: Arc<dyn DiskBackend>,
    ) -> Result<Self> {
        let name = name.into();
        let mut head = vec![0_u8; 4096.min(metadata.len_bytes() as usize)];
        metadata.read_exact_at(0, &mut head)?;
        let superblock = ThinSuperblock::parse(&head)
            .map_err(|err| parse_error_to_vms(format!("thin pool {name} superblock"), &err))?;
        let reader = MetadataReader::new(metadata, superblock.metadata_block_bytes())?;
        debug!(
            pool = %name,
            data_block_size = superblock.data_block_bytes(),
            transaction_id = superblock.transaction_id,
            "thin pool opened"
        );
        Ok(Self {
            name,
            reader,
            data,
            superblock,
            device_roots: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn superblock(&self) -> &ThinSuperblock {
        &self.superblock
    }

    #[must_use]
    pub fn data(&self) -> &Arc<dyn DiskBackend> {
        &self.data
    }

    /// Data block size in bytes.
    #[must_use]
    pub fn data_block_size(&self) -> u64 {
        self.superblock.data_block_bytes()
    }

    pub fn device_details(&self, device_id: u64) -> Result<Option<DeviceDetails>> {
        self.reader
            .lookup(self.superblock.device_details_root, device_id)?
            .map(|v| DeviceDetails::parse(&v))
            .transpose()
    }

    /// Every device id with its details, in id order.
    pub fn devices(&self) -> Result<Vec<(u64, DeviceDetails)>> {
        let mut out = Vec::new();
        self.reader
            .walk(self.superblock.device_details_root, &mut |id, value| {
                out.push((id, DeviceDetails::parse(value)?));
                Ok(())
            })?;
        Ok(out)
    }

    fn device_root(&self, device_id: u64) -> Result<u64> {
        if let Some(root) = self.device_roots.lock().get(&device_id) {
            return root.ok_or_else(|| self.missing_device(device_id));
        }
        let root = self
            .reader
            .lookup(self.superblock.data_mapping_root, device_id)?
            .map(|v| read_le_u64(&v, 0))
            .transpose()
            .map_err(|err| parse_error_to_vms(format!("thin pool {} mapping tree", self.name), &err))?;
        self.device_roots.lock().insert(device_id, root);
        root.ok_or_else(|| self.missing_device(device_id))
    }

    fn missing_device(&self, device_id: u64) -> VmsError {
        VmsError::NotFound(format!("thin device {device_id} in pool {}", self.name))
    }

    /// Mapping of one virtual block of `device_id`.
    pub fn lookup_block(&self, device_id: u64, block: u64) -> Result<Option<BlockMapping>> {
        let root = self.device_root(device_id)?;
        let Some(value) = self.reader.lookup(root, block)? else {
            return Ok(None);
        };
        let raw = read_le_u64(&value, 0)
            .map_err(|err| parse_error_to_vms(format!("thin device {device_id} block tree"), &err))?;
        Ok(Some(BlockMapping::unpack(raw)))
    }

    /// Translate `[pos, pos + len)` of a thin device into per-block runs.
    ///
    /// The first run starts at `pos` inside its block; the last one stops at
    /// `pos + len`. Run lengths always add up to exactly `len`.
    pub fn device_to_data(&self, device_id: u64, pos: u64, len: u64) -> Result<Vec<DataRun>> {
        let block_size = self.data_block_size();
        let mut runs = Vec::new();
        let mut done = 0_u64;
        while done < len {
            let at = pos + done;
            let device_block = at / block_size;
            let within = at % block_size;
            let run_len = (block_size - within).min(len - done);
            let mapping = self.lookup_block(device_id, device_block)?;
            let data_block = mapping.map(|m| m.data_block);
            let start = data_block.map(|b| b * block_size + within);
            trace!(device_id, device_block, ?data_block, run_len, "thin translate");
            runs.push(DataRun {
                device_block,
                data_block,
                start,
                len: run_len,
            });
            done += run_len;
        }
        Ok(runs)
    }

    /// Read from a thin device; unprovisioned blocks read as zeros.
    pub fn read_device(&self, device_id: u64, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut at = 0_usize;
        for run in self.device_to_data(device_id, pos, buf.len() as u64)? {
            let chunk = &mut buf[at..at + run.len as usize];
            match run.start {
                Some(start) => self.data.read_exact_at(start, chunk)?,
                None => chunk.fill(0),
            }
            at += run.len as usize;
        }
        Ok(())
    }

    /// Write to provisioned blocks only. Provisioning new blocks would need
    /// a metadata transaction and is refused.
    pub fn write_device(&self, device_id: u64, pos: u64, buf: &[u8]) -> Result<()> {
        let runs = self.device_to_data(device_id, pos, buf.len() as u64)?;
        if let Some(hole) = runs.iter().find(|r| r.start.is_none()) {
            return Err(VmsError::unsupported_op(
                format!("provision block {}", hole.device_block),
                format!("thin pool {}", self.name),
            ));
        }
        let mut at = 0_usize;
        for run in runs {
            if let Some(start) = run.start {
                self.data.write_all_at(start, &buf[at..at + run.len as usize])?;
            }
            at += run.len as usize;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<ThinPoolStats> {
        let data = SpaceMap::new(&self.reader, self.superblock.data_space_map, SpaceMapKind::Data);
        let metadata = SpaceMap::new(
            &self.reader,
            self.superblock.metadata_space_map,
            SpaceMapKind::Metadata,
        );
        Ok(ThinPoolStats {
            data_block_size: self.data_block_size(),
            data_blocks: self.superblock.data_space_map.nr_blocks,
            data_allocated: data.counted_allocated()?,
            metadata_blocks: self.superblock.metadata_space_map.nr_blocks,
            metadata_allocated: metadata.counted_allocated()?,
        })
    }

    /// Reference count of a data block.
    pub fn data_ref_count(&self, data_block: u64) -> Result<u32> {
        SpaceMap::new(&self.reader, self.superblock.data_space_map, SpaceMapKind::Data)
            .ref_count(data_block)
    }

    /// Drop cached metadata nodes. The backends belong to the logical
    /// volumes that carry them.
    pub fn release(&self) {
        self.reader.clear_cache();
        self.device_roots.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_values_split_block_and_time() {
        let m = BlockMapping::unpack((77 << 24) | 5);
        assert_eq!(
            m,
            BlockMapping {
                data_block: 77,
                time: 5
            }
        );
    }
}
