//! Passthrough to logical volumes the host has already activated.
//!
//! Device-mapper exposes every active logical volume as
//! `<dev_root>/mapper/<vg>-<lv>`, with hyphens inside either name doubled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use vms_block::{AccessMode, DiskBackend, FileBackend};
use vms_error::Result;

use crate::label::read_label;
use crate::{PhysicalVolume, Volume, VolumeKind, VolumeManager};

#[derive(Debug)]
pub struct NativeVolumeManager {
    physical: Vec<PhysicalVolume>,
    opened: Vec<Arc<dyn DiskBackend>>,
    visible: Vec<Volume>,
    closed: AtomicBool,
}

/// Split a device-mapper name into `(vg, lv)`. `None` for names without a
/// single unescaped hyphen.
#[must_use]
pub fn decode_mapper_name(name: &str) -> Option<(String, String)> {
    let mut vg = String::new();
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '-' {
            vg.push(c);
            continue;
        }
        if chars.peek() == Some(&'-') {
            chars.next();
            vg.push('-');
            continue;
        }
        let rest: String = chars.collect();
        let lv = rest.replace("--", "-");
        if vg.is_empty() || lv.is_empty() {
            return None;
        }
        return Some((vg, lv));
    }
    None
}

impl NativeVolumeManager {
    /// Open every `<dev_root>/mapper/*` node with `mode`. PVs without an
    /// LVM label stay visible as plain volumes.
    pub fn new(physical: Vec<PhysicalVolume>, dev_root: &Path, mode: AccessMode) -> Result<Self> {
        let mut visible = Vec::new();
        for pv in &physical {
            match read_label(pv.backend.as_ref()) {
                Ok(Some(_)) => debug!(pv = %pv.name, "LVM physical volume hidden behind mapper devices"),
                Ok(None) => visible.push(Volume {
                    name: pv.name.clone(),
                    backend: Arc::clone(&pv.backend),
                    kind: VolumeKind::Physical {
                        hardware_id: pv.hardware_id.clone(),
                        partition: pv.partition,
                    },
                }),
                Err(err) => {
                    warn!(pv = %pv.name, error = %err, "unreadable LVM label, treating as plain volume");
                    visible.push(Volume {
                        name: pv.name.clone(),
                        backend: Arc::clone(&pv.backend),
                        kind: VolumeKind::Physical {
                            hardware_id: pv.hardware_id.clone(),
                            partition: pv.partition,
                        },
                    });
                }
            }
        }

        let mut opened: Vec<Arc<dyn DiskBackend>> = Vec::new();
        for (path, vg, lv) in mapper_nodes(&dev_root.join("mapper"))? {
            match FileBackend::open(&path, mode) {
                Ok(dev) => {
                    let dev: Arc<dyn DiskBackend> = Arc::new(dev);
                    opened.push(Arc::clone(&dev));
                    visible.push(Volume {
                        name: format!("{vg}/{lv}"),
                        backend: dev,
                        kind: VolumeKind::Logical {
                            vg_name: vg,
                            lv_name: lv,
                            lv_uuid: None,
                        },
                    });
                }
                Err(err) => warn!(path = %path.display(), error = %err, "cannot open mapper device"),
            }
        }
        info!(
            root = %dev_root.display(),
            logical = opened.len(),
            visible = visible.len(),
            "native volume manager ready"
        );
        Ok(Self {
            physical,
            opened,
            visible,
            closed: AtomicBool::new(false),
        })
    }
}

/// `(path, vg, lv)` of each mapper node, sorted by file name. A missing
/// mapper directory means no active logical volumes.
fn mapper_nodes(dir: &Path) -> Result<Vec<(PathBuf, String, String)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut nodes = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name == "control" {
            continue;
        }
        match decode_mapper_name(name) {
            Some((vg, lv)) => nodes.push((entry.path(), vg, lv)),
            None => debug!(name, "mapper node is not a logical volume"),
        }
    }
    nodes.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(nodes)
}

impl VolumeManager for NativeVolumeManager {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn physical_volumes(&self) -> &[PhysicalVolume] {
        &self.physical
    }

    fn visible_volumes(&self) -> &[Volume] {
        &self.visible
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for dev in self.opened.iter().chain(self.physical.iter().map(|pv| &pv.backend)) {
            if let Err(err) = dev.close() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_doubled_hyphens() {
        assert_eq!(
            decode_mapper_name("vg--data-lv--home"),
            Some(("vg-data".to_owned(), "lv-home".to_owned()))
        );
        assert_eq!(
            decode_mapper_name("centos-root"),
            Some(("centos".to_owned(), "root".to_owned()))
        );
        assert_eq!(decode_mapper_name("nohyphen"), None);
        assert_eq!(decode_mapper_name("-lv"), None);
        assert_eq!(decode_mapper_name("vg-"), None);
    }
}
