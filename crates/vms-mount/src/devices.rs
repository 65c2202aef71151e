//! Guest device names for VM controller slots.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

/// Controllers whose disks Linux names `/dev/sdX` in discovery order.
const SD_CONTROLLERS: [&str; 3] = ["scsi", "sata", "nvme"];

/// Maps VM hardware ids (`scsi0:1`, `ide1:0`) to the device names a Linux
/// guest sees for them.
///
/// IDE slots have fixed names. Every other supported controller consumes the
/// next `sd` letter, so the table must be built from all of the VM's disks
/// in descriptor order, including disks that carry no visible volume.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceNameTable {
    names: BTreeMap<String, String>,
}

impl DeviceNameTable {
    pub fn new<'a>(hardware_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut names = BTreeMap::new();
        let mut next_sd = 0_usize;
        for id in hardware_ids {
            if names.contains_key(id) {
                debug!(hardware_id = id, "duplicate hardware id ignored");
                continue;
            }
            let name = if let Some(name) = ide_name(id) {
                name.to_owned()
            } else if SD_CONTROLLERS.iter().any(|c| id.starts_with(c)) {
                let name = format!("/dev/sd{}", disk_letters(next_sd));
                next_sd += 1;
                name
            } else {
                debug!(hardware_id = id, "no guest device name for controller");
                continue;
            };
            debug!(hardware_id = id, device = %name, "assigned guest device name");
            names.insert(id.to_owned(), name);
        }
        Self { names }
    }

    /// Whole-disk device, e.g. `/dev/sdb`.
    #[must_use]
    pub fn device(&self, hardware_id: &str) -> Option<&str> {
        self.names.get(hardware_id).map(String::as_str)
    }

    /// Device of partition `partition` (0 = whole disk), e.g. `/dev/sdb2`.
    #[must_use]
    pub fn partition_device(&self, hardware_id: &str, partition: u32) -> Option<String> {
        let disk = self.device(hardware_id)?;
        Some(if partition == 0 {
            disk.to_owned()
        } else {
            format!("{disk}{partition}")
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.names.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn ide_name(id: &str) -> Option<&'static str> {
    match id {
        "ide0:0" => Some("/dev/hda"),
        "ide0:1" => Some("/dev/hdb"),
        "ide1:0" => Some("/dev/hdc"),
        "ide1:1" => Some("/dev/hdd"),
        _ => None,
    }
}

/// `a`..`z`, then `aa`, `ab`, ... as the kernel names them.
fn disk_letters(index: usize) -> String {
    let mut n = index;
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
