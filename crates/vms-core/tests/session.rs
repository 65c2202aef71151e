use std::sync::Arc;

use vms_block::{DiskBackend, MemoryBackend};
use vms_core::{VmConfig, VmSession, VolumeManagerKind};
use vms_disk::DiskDescriptor;
use vms_error::VmsError;
use vms_fs::FileSystem;
use vms_harness::SECTOR;
use vms_harness::ext4::Ext4Builder;
use vms_harness::lvm::{SegmentText, VgText, extent_offset, pv_image, raw_uuid};
use vms_harness::partition::{DosPart, mbr_disk};
use vms_harness::place;
use vms_mount::GuestOs;

const EXTENT_SECTORS: u64 = 128;
const EXTENT: usize = 64 * 1024;
const PV_SIZE: usize = 4 << 20;
const PV_EXTENTS: u64 = 48;
const HOME_EXTENTS: u64 = 16;

const FSTAB: &str = "\
LABEL=root      /       ext4 defaults 0 1
/dev/vg0/home   /home   ext4 defaults 0 2
/dev/sdb        /data   ext4 defaults 0 2
/dev/sda3       none    swap sw       0 0
";

fn sectors(len: usize) -> u32 {
    u32::try_from(len.div_ceil(SECTOR)).expect("sectors")
}

fn root_fs() -> Vec<u8> {
    Ext4Builder::new()
        .label("root")
        .file("/etc/fstab", FSTAB.as_bytes())
        .file("/etc/hostname", b"inspected\n")
        .dir("/home")
        .dir("/data")
        .build()
}

fn home_fs() -> Vec<u8> {
    Ext4Builder::new()
        .label("home")
        .file("/bob/notes.txt", b"remember the milk\n")
        .build()
}

fn lvm_pv() -> Vec<u8> {
    let uuid = raw_uuid("pv-session");
    let text = VgText::new("vg0", 3, EXTENT_SECTORS)
        .pv("pv0", &uuid, PV_EXTENTS)
        .lv("home", true, &[SegmentText::linear(0, HOME_EXTENTS, "pv0", 0)])
        .render();
    let mut pv = pv_image(&uuid, PV_SIZE, Some(&text));
    let home = home_fs();
    assert!(home.len() <= HOME_EXTENTS as usize * EXTENT);
    place(&mut pv, extent_offset(0, EXTENT_SECTORS), &home);
    pv
}

/// Root filesystem in partition 1, LVM PV in partition 2.
fn system_disk() -> Vec<u8> {
    let root = root_fs();
    let pv = lvm_pv();
    let root_start = 2048_u32;
    let root_len = sectors(root.len());
    let pv_start = (root_start + root_len).div_ceil(2048) * 2048;
    let pv_len = sectors(pv.len());
    let total = u64::from(pv_start + pv_len) + 64;
    let mut image = mbr_disk(
        total,
        &[DosPart::new(0x83, root_start, root_len), DosPart::new(0x8E, pv_start, pv_len)],
        0x5EED_0001,
    );
    place(&mut image, root_start as usize * SECTOR, &root);
    place(&mut image, pv_start as usize * SECTOR, &pv);
    image
}

fn data_disk() -> Vec<u8> {
    Ext4Builder::new()
        .file("/backups/db.sql", b"CREATE TABLE t;\n")
        .build()
}

fn descriptor(backend: &Arc<MemoryBackend>, hardware_id: &str) -> DiskDescriptor {
    let backend: Arc<dyn DiskBackend> = Arc::clone(backend) as Arc<dyn DiskBackend>;
    DiskDescriptor::backend(backend).with_hardware_id(hardware_id)
}

struct Vm {
    system: Arc<MemoryBackend>,
    data: Arc<MemoryBackend>,
    config: VmConfig,
}

fn vm() -> Vm {
    let system = Arc::new(MemoryBackend::new(system_disk()));
    let data = Arc::new(MemoryBackend::new(data_disk()));
    let config = VmConfig::new(vec![
        descriptor(&system, "scsi0:0"),
        descriptor(&data, "scsi0:1"),
        DiskDescriptor::local("/nonexistent/vm/disk2.vmdk").with_hardware_id("scsi0:2"),
    ]);
    Vm {
        system,
        data,
        config,
    }
}

#[test]
fn session_mounts_the_linux_root_across_disks_and_lvm() {
    let Vm { config, .. } = vm();
    let session = VmSession::open(config).expect("open session");

    assert_eq!(session.disks().len(), 2);
    assert!(session.disk_init_errors().contains_key("scsi0:2"));
    assert_eq!(session.volume_manager().kind(), "lvm");
    assert_eq!(session.device_names().device("scsi0:1"), Some("/dev/sdb"));
    assert_eq!(session.device_names().device("scsi0:2"), Some("/dev/sdc"));

    let roots = session.root_trees();
    assert_eq!(roots.len(), 1);
    let tree = &roots[0];
    assert_eq!(tree.os(), GuestOs::Linux);
    assert_eq!(tree.read_file("/etc/hostname").expect("root"), b"inspected\n");
    assert_eq!(
        tree.read_file("/home/bob/notes.txt").expect("logical volume"),
        b"remember the milk\n"
    );
    assert_eq!(
        tree.read_file("/data/backups/db.sql").expect("second disk"),
        b"CREATE TABLE t;\n"
    );
    let points: Vec<&str> = tree.mounts().iter().map(|m| m.point.as_str()).collect();
    assert_eq!(points, vec!["/", "/home", "/data"]);
}

#[test]
fn partitions_and_whole_disks_become_volumes() {
    let Vm { config, .. } = vm();
    let session = VmSession::open(config).expect("open session");
    let mut names: Vec<&str> = session
        .volume_manager()
        .physical_volumes()
        .iter()
        .map(|pv| pv.name.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["scsi0:0p1", "scsi0:0p2", "scsi0:1"]);

    let visible: Vec<&str> = session
        .volume_manager()
        .visible_volumes()
        .iter()
        .map(|v| v.name.as_str())
        .collect();
    assert!(visible.contains(&"vg0/home"));
    assert!(!visible.contains(&"scsi0:0p2"));
    assert_eq!(session.filesystems().len(), 3);
    assert!(session.unformatted_volumes().is_empty());
}

#[test]
fn report_summarises_the_session() {
    let Vm { config, .. } = vm();
    let session = VmSession::open(config).expect("open session");
    let report = session.report();
    assert_eq!(report.disks.len(), 2);
    assert_eq!(report.disks[0].partitions.len(), 2);
    assert_eq!(report.volume_manager, "lvm");
    assert_eq!(report.roots.len(), 1);
    assert_eq!(report.roots[0].volume, "scsi0:0p1");
    assert_eq!(report.roots[0].mounts[1].spec, "/dev/vg0/home");
    let root_volume = report
        .volumes
        .iter()
        .find(|v| v.name == "scsi0:0p1")
        .expect("root volume");
    assert_eq!(root_volume.guest_device.as_deref(), Some("/dev/sda1"));
    assert_eq!(root_volume.fs_type, Some("ext4"));
    let home = report
        .filesystems
        .iter()
        .find(|f| f.volume == "vg0/home")
        .expect("home fs");
    assert_eq!(home.label.as_deref(), Some("home"));
    assert!(home.free_bytes.is_some());

    let json = serde_json::to_value(&report).expect("json");
    assert_eq!(json["roots"][0]["os"], "linux");
    assert_eq!(json["disk_init_errors"].as_object().map(|m| m.len()), Some(1));
    let text = report.to_string();
    assert!(text.contains("/home"));
    assert!(text.contains("scsi0:2"));
}

#[test]
fn unmount_closes_each_disk_once() {
    let Vm {
        system,
        data,
        config,
    } = vm();
    let mut session = VmSession::open(config).expect("open session");
    assert!(!system.is_closed());
    session.unmount().expect("unmount");
    assert!(session.is_closed());
    assert!(session.volume_manager().is_closed());
    assert!(system.is_closed());
    assert!(data.is_closed());
    assert!(session.root_trees().is_empty());
    session.unmount().expect("second unmount is a no-op");
}

#[test]
fn dropping_the_session_releases_disks() {
    let Vm { system, config, .. } = vm();
    drop(VmSession::open(config).expect("open session"));
    assert!(system.is_closed());
}

#[test]
fn native_manager_uses_mapper_nodes() {
    let dev_root = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dev_root.path().join("mapper")).expect("mapper dir");
    std::fs::write(dev_root.path().join("mapper/control"), b"").expect("control");
    std::fs::write(dev_root.path().join("mapper/vg0-home"), home_fs()).expect("lv node");

    let Vm { config, .. } = vm();
    let config = config.with_volume_manager(VolumeManagerKind::Native {
        dev_root: dev_root.path().to_path_buf(),
    });
    let session = VmSession::open(config).expect("open session");
    assert_eq!(session.volume_manager().kind(), "native");
    let tree = &session.root_trees()[0];
    assert_eq!(
        tree.read_file("/home/bob/notes.txt").expect("mapper device"),
        b"remember the milk\n"
    );
}

#[test]
fn no_openable_disk_is_an_error() {
    let config = VmConfig::new(vec![
        DiskDescriptor::local("/nonexistent/a.vmdk").with_hardware_id("scsi0:0"),
    ]);
    let err = VmSession::open(config).expect_err("nothing to inspect");
    assert!(matches!(err, VmsError::InvalidConfig(_)));
    assert!(matches!(
        VmSession::open(VmConfig::default()),
        Err(VmsError::InvalidConfig(_))
    ));
}
