#![forbid(unsafe_code)]
//! Inspection sessions over one virtual machine's disks.
//!
//! [`VmSession::open`] walks the whole stack: it opens every disk in the
//! [`VmConfig`], splits disks into partitions, hands the resulting physical
//! volumes to a volume manager and mounts the guest operating system roots
//! found on the visible volumes. Disks that fail to open are recorded and
//! skipped so one bad image does not hide the others.

mod report;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vms_block::AccessMode;
use vms_disk::{Disk, DiskDescriptor, FormatRegistry};
use vms_error::{Result, VmsError};
use vms_fs::FsCacheConfig;
use vms_mount::{DeviceNameTable, MountSet, MountTree, MountedVolume, mount_volumes};
use vms_volume::{
    LvmVolumeManager, NativeVolumeManager, PhysicalVolume, Volume, VolumeManager,
};

pub use report::{
    FilesystemReport, InspectReport, MountReport, RootReport, VolumeReport,
};

/// Which volume manager assembles logical volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeManagerKind {
    /// Decode LVM2 metadata from the disks.
    #[default]
    Lvm,
    /// Use the device-mapper nodes under `dev_root` that the host has
    /// already activated.
    Native { dev_root: PathBuf },
}

/// Everything needed to inspect one VM.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// In controller order; guest device names are assigned from it.
    pub disks: Vec<DiskDescriptor>,
    pub volume_manager: VolumeManagerKind,
    pub fs_cache: FsCacheConfig,
}

impl VmConfig {
    #[must_use]
    pub fn new(disks: Vec<DiskDescriptor>) -> Self {
        Self {
            disks,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_volume_manager(mut self, kind: VolumeManagerKind) -> Self {
        self.volume_manager = kind;
        self
    }

    #[must_use]
    pub fn with_fs_cache(mut self, cache: FsCacheConfig) -> Self {
        self.fs_cache = cache;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.disks.is_empty() {
            return Err(VmsError::InvalidConfig("VM has no disks".to_owned()));
        }
        if let VolumeManagerKind::Native { dev_root } = &self.volume_manager {
            if dev_root.as_os_str().is_empty() {
                return Err(VmsError::InvalidConfig(
                    "native volume manager needs a device root".to_owned(),
                ));
            }
        }
        self.fs_cache.validate()
    }
}

/// Open disks, volumes and mounted roots of one VM.
///
/// Ownership runs top-down: the session owns the whole disks, the volume
/// manager borrows views of them, and filesystems read through the volume
/// manager's volumes. [`VmSession::unmount`] releases them in reverse.
#[derive(Debug)]
pub struct VmSession {
    disks: Vec<Disk>,
    disk_init_errors: BTreeMap<String, String>,
    devices: DeviceNameTable,
    manager: Box<dyn VolumeManager>,
    mounts: MountSet,
    closed: bool,
}

impl VmSession {
    pub fn open(config: VmConfig) -> Result<Self> {
        Self::open_with_registry(config, &FormatRegistry::default())
    }

    /// Like [`VmSession::open`] with a caller-chosen set of disk formats.
    pub fn open_with_registry(config: VmConfig, registry: &FormatRegistry) -> Result<Self> {
        config.validate()?;
        let devices = DeviceNameTable::new(
            config
                .disks
                .iter()
                .filter_map(|d| d.hardware_id.as_deref()),
        );

        let mut disks = Vec::with_capacity(config.disks.len());
        let mut disk_init_errors = BTreeMap::new();
        for desc in &config.disks {
            match Disk::open(desc, registry) {
                Ok(disk) => disks.push(disk),
                Err(err) => {
                    let key = desc.display_name();
                    warn!(disk = %key, error = %err, "disk failed to open, skipping");
                    disk_init_errors.insert(key, err.to_string());
                }
            }
        }
        if disks.is_empty() {
            return Err(VmsError::InvalidConfig(format!(
                "none of the VM's {} disks could be opened",
                config.disks.len()
            )));
        }

        let physical = match physical_volumes(&mut disks) {
            Ok(physical) => physical,
            Err(err) => {
                close_disks(&mut disks);
                return Err(err);
            }
        };
        let manager: Box<dyn VolumeManager> = match build_manager(&config.volume_manager, physical)
        {
            Ok(manager) => manager,
            Err(err) => {
                close_disks(&mut disks);
                return Err(err);
            }
        };
        let mounts = match mount_volumes(manager.visible_volumes(), &devices, &config.fs_cache) {
            Ok(mounts) => mounts,
            Err(err) => {
                let _ = manager.close();
                close_disks(&mut disks);
                return Err(err);
            }
        };
        info!(
            disks = disks.len(),
            failed = disk_init_errors.len(),
            volumes = manager.visible_volumes().len(),
            roots = mounts.trees.len(),
            "VM session open"
        );
        Ok(Self {
            disks,
            disk_init_errors,
            devices,
            manager,
            mounts,
            closed: false,
        })
    }

    #[must_use]
    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    /// Disks that failed to open, keyed by hardware id (or source when the
    /// disk has none).
    #[must_use]
    pub fn disk_init_errors(&self) -> &BTreeMap<String, String> {
        &self.disk_init_errors
    }

    #[must_use]
    pub fn device_names(&self) -> &DeviceNameTable {
        &self.devices
    }

    #[must_use]
    pub fn volume_manager(&self) -> &dyn VolumeManager {
        self.manager.as_ref()
    }

    /// One mount tree per guest operating system found.
    #[must_use]
    pub fn root_trees(&self) -> &[MountTree] {
        &self.mounts.trees
    }

    #[must_use]
    pub fn filesystems(&self) -> &[MountedVolume] {
        &self.mounts.filesystems
    }

    /// Visible volumes without a recognised filesystem.
    #[must_use]
    pub fn unformatted_volumes(&self) -> &[Volume] {
        &self.mounts.unformatted
    }

    #[must_use]
    pub fn report(&self) -> InspectReport {
        InspectReport::collect(self)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the volume manager, then every whole disk. Idempotent; the
    /// first error is returned after everything has been attempted.
    pub fn unmount(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.mounts = MountSet::default();
        let mut first_err = self.manager.close().err();
        for disk in &mut self.disks {
            if let Err(err) = disk.close() {
                warn!(disk = %disk.name(), error = %err, "disk close failed");
                first_err.get_or_insert(err);
            }
        }
        debug!(disks = self.disks.len(), "VM session unmounted");
        first_err.map_or(Ok(()), Err)
    }

    pub(crate) fn mount_set(&self) -> &MountSet {
        &self.mounts
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if let Err(err) = self.unmount() {
            warn!(error = %err, "VM session close failed on drop");
        }
    }
}

/// Partitions of each disk, or the whole disk when it has none. A partition
/// table that cannot be read leaves the disk whole.
fn physical_volumes(disks: &mut [Disk]) -> Result<Vec<PhysicalVolume>> {
    let mut physical = Vec::new();
    for disk in disks {
        let hardware_id = disk.hardware_id().map(str::to_owned);
        let name = disk.name().to_owned();
        let parts: &[Disk] = match disk.get_partitions() {
            Ok(parts) => parts,
            Err(err) => {
                warn!(disk = %name, error = %err, "partition scan failed, using whole disk");
                &[]
            }
        };
        if parts.is_empty() {
            physical.push(PhysicalVolume {
                name,
                backend: disk.view()?,
                hardware_id,
                partition: 0,
            });
            continue;
        }
        for part in parts {
            physical.push(PhysicalVolume {
                name: part.name().to_owned(),
                backend: part.view()?,
                hardware_id: hardware_id.clone(),
                partition: part.partition_number(),
            });
        }
    }
    Ok(physical)
}

fn build_manager(
    kind: &VolumeManagerKind,
    physical: Vec<PhysicalVolume>,
) -> Result<Box<dyn VolumeManager>> {
    Ok(match kind {
        VolumeManagerKind::Lvm => Box::new(LvmVolumeManager::new(physical)?),
        VolumeManagerKind::Native { dev_root } => Box::new(NativeVolumeManager::new(
            physical,
            dev_root,
            AccessMode::ReadOnly,
        )?),
    })
}

fn close_disks(disks: &mut [Disk]) {
    for disk in disks {
        if let Err(err) = disk.close() {
            warn!(disk = %disk.name(), error = %err, "disk close failed");
        }
    }
}

/// Filesystem of `volume`, when one was found.
pub(crate) fn filesystem_of<'a>(
    set: &'a MountSet,
    volume: &str,
) -> Option<&'a Arc<dyn vms_fs::FileSystem>> {
    set.filesystems
        .iter()
        .find(|mv| mv.volume.name == volume)
        .map(|mv| &mv.fs)
}
