#![forbid(unsafe_code)]
//! Volume managers.
//!
//! A volume manager takes the physical volumes of a VM (whole disks or
//! partitions) and returns the volumes a filesystem probe should look at:
//! plain physical volumes, plus the logical volumes assembled from the ones
//! that carry an LVM2 label.
//!
//! Two implementations share the [`VolumeManager`] trait:
//!
//! - [`LvmVolumeManager`] decodes LVM2 labels and text metadata itself,
//!   maps striped, zero and error segments, and reads thin volumes through
//!   the pool's B-tree metadata ([`thin`]).
//! - [`NativeVolumeManager`] opens the device-mapper nodes the host has
//!   already activated.
//!
//! Ownership: physical volumes are borrowed views of disks owned by the
//! caller. `close` closes each logical volume and each physical volume
//! handle exactly once; whole disks are closed by their owner.

pub mod config;
pub mod label;
pub mod lvm;
pub mod manager;
pub mod metadata;
pub mod native;
pub mod thin;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use vms_block::DiskBackend;
use vms_error::Result;

pub use label::{DiskArea, PvLabel, read_label};
pub use lvm::LogicalVolume;
pub use manager::LvmVolumeManager;
pub use metadata::{LvMeta, PvMeta, Segment, SegmentKind, VolumeGroup};
pub use native::{NativeVolumeManager, decode_mapper_name};
pub use thin::{DataRun, ThinPool};

/// Input to a volume manager: one whole disk or partition.
#[derive(Debug, Clone)]
pub struct PhysicalVolume {
    /// Disk-level name, e.g. `disk0p1`.
    pub name: String,
    pub backend: Arc<dyn DiskBackend>,
    /// VM controller slot of the owning disk, e.g. `scsi0:0`.
    pub hardware_id: Option<String>,
    /// 0 for a whole disk.
    pub partition: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeKind {
    Physical {
        hardware_id: Option<String>,
        partition: u32,
    },
    Logical {
        vg_name: String,
        lv_name: String,
        /// Known when the metadata was decoded here; native passthrough
        /// only sees device names.
        lv_uuid: Option<String>,
    },
}

/// A volume a filesystem may live on.
#[derive(Clone)]
pub struct Volume {
    pub name: String,
    pub backend: Arc<dyn DiskBackend>,
    pub kind: VolumeKind,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("len", &self.backend.len_bytes())
            .finish()
    }
}

impl Volume {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.backend.len_bytes()
    }

    #[must_use]
    pub fn is_logical(&self) -> bool {
        matches!(self.kind, VolumeKind::Logical { .. })
    }
}

pub trait VolumeManager: Send + Sync + fmt::Debug {
    /// `"lvm"` or `"native"`.
    fn kind(&self) -> &'static str;

    fn physical_volumes(&self) -> &[PhysicalVolume];

    /// Volumes to probe for filesystems, in discovery order.
    fn visible_volumes(&self) -> &[Volume];

    /// Idempotent. Closes logical volumes and physical volume handles once.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
