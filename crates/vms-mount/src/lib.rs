#![forbid(unsafe_code)]
//! Mount manager.
//!
//! [`mount_volumes`] probes every visible volume for a filesystem, finds the
//! ones that hold an operating system root and assembles a [`MountTree`]
//! for each:
//!
//! - Linux roots carry `/etc/fstab`. Its entries are matched against the
//!   probed volumes by label, filesystem UUID, logical volume path or
//!   UUID, and guest device name ([`DeviceNameTable`]).
//! - Windows roots are NTFS volumes with `Windows/System32` (or
//!   `WINNT/System32`). The root becomes `C:`; every other NTFS volume gets
//!   the next drive letter from `D:`.

pub mod devices;
pub mod fstab;
pub mod tree;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use vms_error::Result;
use vms_fs::{FileSystem, FsCacheConfig, probe_filesystem};
use vms_volume::Volume;

pub use devices::DeviceNameTable;
pub use fstab::{FSTAB_PATH, FstabEntry, parse_fstab};
pub use tree::{GuestOs, MountPoint, MountTree};

use fstab::SpecIndex;
use tree::drive_point;

/// Directories whose presence marks an NTFS volume as a Windows system root.
const WINDOWS_SYSTEM_DIRS: [&str; 2] = ["/Windows/System32", "/WINNT/System32"];

/// A volume together with the filesystem found on it.
#[derive(Clone)]
pub struct MountedVolume {
    pub volume: Volume,
    pub fs: Arc<dyn FileSystem>,
}

impl fmt::Debug for MountedVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountedVolume")
            .field("volume", &self.volume.name)
            .field("fs_type", &self.fs.fs_type())
            .finish()
    }
}

/// Result of [`mount_volumes`].
#[derive(Debug, Default)]
pub struct MountSet {
    /// One tree per operating system root, in volume order.
    pub trees: Vec<MountTree>,
    /// Every volume a filesystem was found on.
    pub filesystems: Vec<MountedVolume>,
    /// Volumes with no recognised filesystem.
    pub unformatted: Vec<Volume>,
    /// Volumes whose probe failed, with the reason.
    pub probe_errors: Vec<(String, String)>,
}

/// Probe `volumes` and build a mount tree for every OS root among them.
pub fn mount_volumes(
    volumes: &[Volume],
    devices: &DeviceNameTable,
    cache: &FsCacheConfig,
) -> Result<MountSet> {
    cache.validate()?;
    let mut set = MountSet::default();
    for volume in volumes {
        match probe_filesystem(&volume.name, Arc::clone(&volume.backend), cache) {
            Ok(Some(fs)) => set.filesystems.push(MountedVolume {
                volume: volume.clone(),
                fs,
            }),
            Ok(None) => {
                debug!(volume = %volume.name, "no filesystem on volume");
                set.unformatted.push(volume.clone());
            }
            Err(err) => {
                warn!(volume = %volume.name, error = %err, "filesystem probe failed, skipping volume");
                set.probe_errors.push((volume.name.clone(), err.to_string()));
                set.unformatted.push(volume.clone());
            }
        }
    }

    let specs = SpecIndex::build(&set.filesystems, devices);
    for (i, mv) in set.filesystems.iter().enumerate() {
        if is_linux_root(mv.fs.as_ref()) {
            let tree = linux_tree(i, &set.filesystems, &specs)?;
            info!(volume = %mv.volume.name, mounts = tree.mounts().len(), "mounted linux root");
            set.trees.push(tree);
        } else if is_windows_root(mv.fs.as_ref()) {
            let tree = windows_tree(i, &set.filesystems)?;
            info!(volume = %mv.volume.name, drives = tree.mounts().len(), "mounted windows root");
            set.trees.push(tree);
        }
    }
    Ok(set)
}

fn is_linux_root(fs: &dyn FileSystem) -> bool {
    matches!(fs.is_file(FSTAB_PATH), Ok(true))
}

fn is_windows_root(fs: &dyn FileSystem) -> bool {
    fs.fs_type() == "ntfs"
        && WINDOWS_SYSTEM_DIRS
            .iter()
            .any(|dir| matches!(fs.is_dir(dir), Ok(true)))
}

fn mount_at(point: String, spec: &str, mv: &MountedVolume) -> MountPoint {
    MountPoint {
        point,
        spec: spec.to_owned(),
        volume: mv.volume.name.clone(),
        fs: Arc::clone(&mv.fs),
    }
}

/// Root filesystem plus every fstab entry that names a probed volume. An
/// unreadable fstab leaves the root alone.
fn linux_tree(root: usize, all: &[MountedVolume], specs: &SpecIndex) -> Result<MountTree> {
    let root_mv = &all[root];
    let mut mounts = vec![mount_at("/".to_owned(), "ROOT", root_mv)];
    let entries = match root_mv.fs.read_file(FSTAB_PATH) {
        Ok(bytes) => parse_fstab(&String::from_utf8_lossy(&bytes)),
        Err(err) => {
            warn!(volume = %root_mv.volume.name, error = %err, "unreadable fstab, mounting root only");
            Vec::new()
        }
    };
    for entry in entries {
        if !entry.mount_point.starts_with('/') {
            debug!(spec = %entry.spec, point = %entry.mount_point, "relative mount point ignored");
            continue;
        }
        let point = vms_fs::normalize_path(&entry.mount_point);
        let Some(idx) = specs.resolve(&entry.spec) else {
            debug!(spec = %entry.spec, point = %point, "fstab spec matches no volume");
            continue;
        };
        if point == "/" {
            if idx != root {
                warn!(spec = %entry.spec, "fstab names a different root volume, keeping the probed root");
            }
            mounts[0].spec.clone_from(&entry.spec);
            continue;
        }
        debug!(spec = %entry.spec, point = %point, volume = %all[idx].volume.name, "adding mount point");
        mounts.retain(|m| m.point != point);
        mounts.push(mount_at(point, &entry.spec, &all[idx]));
    }
    MountTree::new(GuestOs::Linux, mounts)
}

/// `C:` is the root volume; the other NTFS volumes follow from `D:`.
fn windows_tree(root: usize, all: &[MountedVolume]) -> Result<MountTree> {
    let mut mounts = vec![mount_at(drive_point('C'), "C:", &all[root])];
    let mut letters = 'D'..='Z';
    for (i, mv) in all.iter().enumerate() {
        if i == root || mv.fs.fs_type() != "ntfs" {
            continue;
        }
        let Some(letter) = letters.next() else {
            warn!(volume = %mv.volume.name, "out of drive letters");
            break;
        };
        debug!(volume = %mv.volume.name, drive = %letter, "assigned drive letter");
        mounts.push(mount_at(drive_point(letter), &format!("{letter}:"), mv));
    }
    MountTree::new(GuestOs::Windows, mounts)
}
