//! `/etc/fstab` parsing and device-spec resolution.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;
use vms_volume::VolumeKind;

use crate::{DeviceNameTable, MountedVolume};

pub const FSTAB_PATH: &str = "/etc/fstab";

/// One mount line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FstabEntry {
    pub spec: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

/// Parse fstab text. Comments, blank lines, `none` specs and swap entries
/// are dropped; lines with fewer than two fields are ignored.
#[must_use]
pub fn parse_fstab(text: &str) -> Vec<FstabEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().map(unescape);
        let (Some(spec), Some(mount_point)) = (fields.next(), fields.next()) else {
            debug!(line, "fstab line without a mount point");
            continue;
        };
        let fs_type = fields.next().unwrap_or_else(|| "auto".to_owned());
        let options = fields.next().unwrap_or_else(|| "defaults".to_owned());
        if spec == "none" || mount_point == "swap" || mount_point == "none" || fs_type == "swap" {
            continue;
        }
        entries.push(FstabEntry {
            spec,
            mount_point,
            fs_type,
            options,
        });
    }
    entries
}

/// Decode the `\ooo` octal escapes fstab uses for blanks in fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            if let Some(code) = octal(&bytes[i + 1..i + 4]) {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn octal(digits: &[u8]) -> Option<u8> {
    let mut value = 0_u16;
    for d in digits {
        if !(b'0'..=b'7').contains(d) {
            return None;
        }
        value = value * 8 + u16::from(d - b'0');
    }
    u8::try_from(value).ok()
}

/// Every spelling an fstab spec may use for each mounted volume.
#[derive(Debug, Default)]
pub(crate) struct SpecIndex {
    by_spec: HashMap<String, usize>,
}

impl SpecIndex {
    pub(crate) fn build(volumes: &[MountedVolume], devices: &DeviceNameTable) -> Self {
        let mut index = Self::default();
        for (i, mv) in volumes.iter().enumerate() {
            if let Some(label) = mv.fs.volume_name().filter(|l| !l.is_empty()) {
                index.add(format!("LABEL={label}"), i);
                index.add(format!("LABEL=/{label}"), i);
            }
            let fs_id = mv.fs.fs_id();
            if !fs_id.is_empty() {
                index.add(format!("UUID={fs_id}"), i);
            }
            match &mv.volume.kind {
                VolumeKind::Logical {
                    vg_name,
                    lv_name,
                    lv_uuid,
                } => {
                    index.add(format!("/dev/{vg_name}/{lv_name}"), i);
                    index.add(
                        format!(
                            "/dev/mapper/{}-{}",
                            vg_name.replace('-', "--"),
                            lv_name.replace('-', "--")
                        ),
                        i,
                    );
                    if let Some(uuid) = lv_uuid {
                        index.add(format!("UUID={uuid}"), i);
                    }
                }
                VolumeKind::Physical {
                    hardware_id,
                    partition,
                } => {
                    if let Some(dev) = hardware_id
                        .as_deref()
                        .and_then(|id| devices.partition_device(id, *partition))
                    {
                        index.add(dev, i);
                    }
                }
            }
        }
        index
    }

    fn add(&mut self, spec: String, volume: usize) {
        self.by_spec.entry(canonical(&spec)).or_insert(volume);
    }

    /// Index of the volume `spec` names.
    pub(crate) fn resolve(&self, spec: &str) -> Option<usize> {
        self.by_spec.get(&canonical(spec)).copied()
    }
}

/// UUIDs compare without regard to case.
fn canonical(spec: &str) -> String {
    match spec.strip_prefix("UUID=") {
        Some(uuid) => format!("UUID={}", uuid.to_ascii_lowercase()),
        None => spec.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_swap_and_none() {
        let text = "\
# /etc/fstab
UUID=1234 /     ext4 defaults 0 1

LABEL=boot /boot ext4 defaults 1 2
/dev/sda3 swap swap defaults 0 0
/dev/sdb1 none swap sw 0 0
none /proc proc defaults 0 0
tmpfs /tmp
/dev/vg0/home\t/home\txfs\tnoatime
loner
";
        let entries = parse_fstab(text);
        let points: Vec<&str> = entries.iter().map(|e| e.mount_point.as_str()).collect();
        assert_eq!(points, vec!["/", "/boot", "/tmp", "/home"]);
        assert_eq!(entries[2].fs_type, "auto");
        assert_eq!(entries[3].options, "noatime");
    }

    #[test]
    fn octal_escapes_are_decoded() {
        let entries = parse_fstab("LABEL=data /mnt/my\\040disk ext4 defaults\n");
        assert_eq!(entries[0].mount_point, "/mnt/my disk");
        assert_eq!(unescape("a\\9zz"), "a\\9zz");
        assert_eq!(unescape("tail\\04"), "tail\\04");
    }

    #[test]
    fn uuid_specs_ignore_case() {
        assert_eq!(canonical("UUID=AbC-1"), "UUID=abc-1");
        assert_eq!(canonical("LABEL=AbC"), "LABEL=AbC");
    }
}
