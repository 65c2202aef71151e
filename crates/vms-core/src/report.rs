//! Serializable summary of an inspection session.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use vms_disk::DiskSummary;
use vms_mount::GuestOs;
use vms_volume::VolumeKind;

use crate::{VmSession, filesystem_of};

#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub disks: Vec<DiskSummary>,
    pub disk_init_errors: BTreeMap<String, String>,
    /// Hardware id to guest device name.
    pub device_names: BTreeMap<String, String>,
    pub volume_manager: &'static str,
    pub volumes: Vec<VolumeReport>,
    pub filesystems: Vec<FilesystemReport>,
    pub roots: Vec<RootReport>,
    pub probe_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeReport {
    pub name: String,
    pub size: u64,
    #[serde(flatten)]
    pub kind: VolumeKind,
    /// Linux device name of a physical volume, e.g. `/dev/sda2`.
    pub guest_device: Option<String>,
    pub fs_type: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesystemReport {
    pub volume: String,
    pub fs_type: &'static str,
    pub label: Option<String>,
    pub fs_id: String,
    /// `None` when free space could not be computed.
    pub free_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RootReport {
    pub os: GuestOs,
    pub volume: String,
    pub mounts: Vec<MountReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MountReport {
    pub point: String,
    pub spec: String,
    pub volume: String,
    pub fs_type: &'static str,
}

impl InspectReport {
    pub(crate) fn collect(session: &VmSession) -> Self {
        let set = session.mount_set();
        let devices = session.device_names();
        let volumes = session
            .volume_manager()
            .visible_volumes()
            .iter()
            .map(|v| VolumeReport {
                name: v.name.clone(),
                size: v.size(),
                kind: v.kind.clone(),
                guest_device: match &v.kind {
                    VolumeKind::Physical {
                        hardware_id: Some(id),
                        partition,
                    } => devices.partition_device(id, *partition),
                    _ => None,
                },
                fs_type: filesystem_of(set, &v.name).map(|fs| fs.fs_type()),
            })
            .collect();
        let filesystems = set
            .filesystems
            .iter()
            .map(|mv| FilesystemReport {
                volume: mv.volume.name.clone(),
                fs_type: mv.fs.fs_type(),
                label: mv.fs.volume_name(),
                fs_id: mv.fs.fs_id(),
                free_bytes: mv.fs.free_bytes().ok(),
            })
            .collect();
        let roots = set
            .trees
            .iter()
            .map(|tree| RootReport {
                os: tree.os(),
                volume: tree.root().volume.clone(),
                mounts: tree
                    .mounts()
                    .iter()
                    .map(|m| MountReport {
                        point: m.point.clone(),
                        spec: m.spec.clone(),
                        volume: m.volume.clone(),
                        fs_type: m.fs.fs_type(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            disks: session.disks().iter().map(vms_disk::Disk::summary).collect(),
            disk_init_errors: session.disk_init_errors().clone(),
            device_names: devices
                .iter()
                .map(|(id, dev)| (id.to_owned(), dev.to_owned()))
                .collect(),
            volume_manager: session.volume_manager().kind(),
            volumes,
            filesystems,
            roots,
            probe_errors: set.probe_errors.iter().cloned().collect(),
        }
    }
}

impl fmt::Display for InspectReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "disks:")?;
        for disk in &self.disks {
            writeln!(
                f,
                "  {:<12} {:<12} {:>14} bytes{}",
                disk.name,
                disk.format,
                disk.size,
                disk.partition_scheme
                    .map(|s| format!("  {s:?}"))
                    .unwrap_or_default()
            )?;
            for part in &disk.partitions {
                writeln!(f, "    {:<12} {:>14} bytes", part.name, part.size)?;
            }
        }
        for (disk, err) in &self.disk_init_errors {
            writeln!(f, "  {disk:<12} failed: {err}")?;
        }

        writeln!(f, "volumes ({}):", self.volume_manager)?;
        for v in &self.volumes {
            writeln!(
                f,
                "  {:<20} {:>14} bytes  {:<6} {}",
                v.name,
                v.size,
                v.fs_type.unwrap_or("-"),
                v.guest_device.as_deref().unwrap_or("")
            )?;
        }
        for (volume, err) in &self.probe_errors {
            writeln!(f, "  {volume:<20} probe failed: {err}")?;
        }

        writeln!(f, "filesystems:")?;
        for fs in &self.filesystems {
            writeln!(
                f,
                "  {:<20} {:<6} label={} id={} free={}",
                fs.volume,
                fs.fs_type,
                fs.label.as_deref().unwrap_or("-"),
                fs.fs_id,
                fs.free_bytes.map_or_else(|| "?".to_owned(), |b| b.to_string())
            )?;
        }

        for root in &self.roots {
            writeln!(f, "{:?} root on {}:", root.os, root.volume)?;
            for m in &root.mounts {
                writeln!(f, "  {:<16} {:<6} {} ({})", m.point, m.fs_type, m.volume, m.spec)?;
            }
        }
        if self.roots.is_empty() {
            writeln!(f, "no operating system root found")?;
        }
        Ok(())
    }
}
