use std::sync::Arc;

use proptest::prelude::*;
use vms_block::MemoryBackend;
use vms_error::VmsError;
use vms_fs::{FileKind, FileSystem, FsCacheConfig};
use vms_harness::ext4::Ext4Builder;
use vms_harness::ntfs::NtfsBuilder;
use vms_mount::{DeviceNameTable, GuestOs, MountSet, MountTree, mount_volumes};
use vms_volume::{Volume, VolumeKind};

const FSTAB: &str = "\
# static file system information
LABEL=rootfs                               /          ext4 defaults 0 1
UUID=11111111-1111-1111-1111-111111111111  /boot      ext4 defaults 0 2
/dev/mapper/vg--sys-home                   /home      ext4 defaults 0 2
/dev/sdb1                                  /srv       ext4 defaults 0 2
UUID=lvuuid-OPT                            /opt       ext4 ro       0 2
LABEL=missing                              /mnt/gone  ext4 defaults 0 0
/dev/sda2                                  none       swap sw       0 0
proc                                       /proc      proc defaults 0 0
";

fn physical(name: &str, image: Vec<u8>, hardware_id: &str, partition: u32) -> Volume {
    Volume {
        name: name.to_owned(),
        backend: Arc::new(MemoryBackend::new(image)),
        kind: VolumeKind::Physical {
            hardware_id: Some(hardware_id.to_owned()),
            partition,
        },
    }
}

fn logical(image: Vec<u8>, vg: &str, lv: &str, uuid: Option<&str>) -> Volume {
    Volume {
        name: format!("{vg}/{lv}"),
        backend: Arc::new(MemoryBackend::new(image)),
        kind: VolumeKind::Logical {
            vg_name: vg.to_owned(),
            lv_name: lv.to_owned(),
            lv_uuid: uuid.map(str::to_owned),
        },
    }
}

fn linux_volumes() -> Vec<Volume> {
    let root = Ext4Builder::new()
        .label("rootfs")
        .file("/etc/fstab", FSTAB.as_bytes())
        .file("/etc/hostname", b"vm1\n")
        .symlink("/vmlinuz", "boot/vmlinuz-6.1")
        .symlink("/etc/alternatives/editor", "/opt/bin/vi")
        .dir("/boot")
        .dir("/home")
        .dir("/srv")
        .dir("/opt")
        .build();
    let boot = Ext4Builder::new()
        .uuid([0x11; 16])
        .file("/vmlinuz-6.1", b"kernel")
        .build();
    let home = Ext4Builder::new()
        .file("/alice/.profile", b"export A=1\n")
        .symlink("/alice/hosts", "/etc/hostname")
        .symlink("/alice/loop", "/home/alice/loop2")
        .symlink("/alice/loop2", "loop")
        .build();
    let srv = Ext4Builder::new()
        .file("/www/index.html", b"<html></html>")
        .build();
    let opt = Ext4Builder::new().file("/bin/vi", b"vi").build();
    vec![
        physical("disk0p1", root, "scsi0:0", 1),
        physical("disk0p3", boot, "scsi0:0", 3),
        logical(home, "vg-sys", "home", Some("lvuuid-home")),
        physical("disk1p1", srv, "scsi0:1", 1),
        logical(opt, "vg-sys", "opt", Some("LVUUID-opt")),
        physical("disk2", vec![0_u8; 1 << 20], "scsi0:2", 0),
    ]
}

fn mount_linux() -> MountSet {
    let devices = DeviceNameTable::new(["scsi0:0", "scsi0:1", "scsi0:2"]);
    mount_volumes(&linux_volumes(), &devices, &FsCacheConfig::default()).expect("mount")
}

fn only_tree(set: &MountSet) -> &MountTree {
    assert_eq!(set.trees.len(), 1);
    &set.trees[0]
}

#[test]
fn fstab_entries_become_mount_points() {
    let set = mount_linux();
    assert_eq!(set.filesystems.len(), 5);
    assert_eq!(set.unformatted.len(), 1);
    assert_eq!(set.unformatted[0].name, "disk2");
    assert!(set.probe_errors.is_empty());

    let tree = only_tree(&set);
    assert_eq!(tree.os(), GuestOs::Linux);
    assert_eq!(tree.fs_type(), "mount");
    assert_eq!(tree.volume_name().as_deref(), Some("rootfs"));
    let points: Vec<(&str, &str)> = tree
        .mounts()
        .iter()
        .map(|m| (m.point.as_str(), m.volume.as_str()))
        .collect();
    assert_eq!(
        points,
        vec![
            ("/", "disk0p1"),
            ("/boot", "disk0p3"),
            ("/home", "vg-sys/home"),
            ("/srv", "disk1p1"),
            ("/opt", "vg-sys/opt"),
        ]
    );
    assert_eq!(tree.root().spec, "LABEL=rootfs");
}

#[test]
fn paths_are_served_by_the_owning_filesystem() {
    let set = mount_linux();
    let tree = only_tree(&set);
    assert_eq!(tree.read_file("/etc/hostname").expect("root"), b"vm1\n");
    assert_eq!(tree.read_file("/boot/vmlinuz-6.1").expect("boot"), b"kernel");
    assert_eq!(tree.read_file("/srv/www/index.html").expect("srv"), b"<html></html>");
    assert_eq!(tree.dir_entries("/home").expect("home"), vec!["alice"]);
    assert!(tree.is_dir("/opt/bin").expect("opt"));
    assert!(!tree.exists("/mnt/gone").expect("unmatched spec"));
    assert!(matches!(
        tree.read_file("/boot/nope"),
        Err(VmsError::NotFound(p)) if p == "/boot/nope"
    ));
}

#[test]
fn symlinks_cross_filesystems() {
    let set = mount_linux();
    let tree = only_tree(&set);
    assert_eq!(tree.read_file("/vmlinuz").expect("relative into /boot"), b"kernel");
    assert_eq!(
        tree.read_file("/etc/alternatives/editor").expect("absolute into /opt"),
        b"vi"
    );
    assert_eq!(
        tree.read_file("/home/alice/hosts").expect("back to root"),
        b"vm1\n"
    );
    assert_eq!(tree.stat("/home/alice/hosts").expect("lstat").kind, FileKind::Symlink);
    assert_eq!(tree.read_link("/home/alice/hosts").expect("link"), "/etc/hostname");
    assert_eq!(
        tree.stat_follow("/vmlinuz").expect("stat").kind,
        FileKind::File
    );
    assert!(matches!(
        tree.read_file("/home/alice/loop"),
        Err(VmsError::SymlinkLoop(_))
    ));
    assert!(matches!(
        tree.dir_entries("/etc/hostname/x"),
        Err(VmsError::NotDirectory(_))
    ));
}

#[test]
fn working_directory_moves_between_filesystems() {
    let set = mount_linux();
    let tree = only_tree(&set);
    let home_free = set.filesystems[2].fs.free_bytes().expect("home free");

    tree.chdir("/home/alice").expect("chdir");
    assert_eq!(tree.pwd(), "/home/alice");
    assert_eq!(tree.read_file(".profile").expect("relative"), b"export A=1\n");
    assert_eq!(tree.free_bytes().expect("free"), home_free);

    tree.chdir("../../boot").expect("dotdot across mounts");
    assert_eq!(tree.pwd(), "/boot");
    assert_eq!(tree.read_file("vmlinuz-6.1").expect("boot relative"), b"kernel");
    assert!(matches!(
        tree.chdir("/etc/hostname"),
        Err(VmsError::NotDirectory(_))
    ));
    assert_eq!(tree.pwd(), "/boot");
}

#[test]
fn missing_fstab_means_no_linux_root() {
    let data = Ext4Builder::new().file("/notes.txt", b"hi").build();
    let volumes = vec![physical("disk0", data, "scsi0:0", 0)];
    let set = mount_volumes(&volumes, &DeviceNameTable::default(), &FsCacheConfig::default())
        .expect("mount");
    assert!(set.trees.is_empty());
    assert_eq!(set.filesystems.len(), 1);
}

#[test]
fn empty_fstab_mounts_the_root_alone() {
    let root = Ext4Builder::new()
        .file("/etc/fstab", b"# nothing here\n")
        .file("/etc/hostname", b"lonely\n")
        .build();
    let volumes = vec![physical("disk0p1", root, "ide0:0", 1)];
    let devices = DeviceNameTable::new(["ide0:0"]);
    let set = mount_volumes(&volumes, &devices, &FsCacheConfig::default()).expect("mount");
    let tree = only_tree(&set);
    assert_eq!(tree.mounts().len(), 1);
    assert_eq!(tree.root().spec, "ROOT");
    assert_eq!(tree.read_file("/etc/hostname").expect("root"), b"lonely\n");
}

#[test]
fn ide_partitions_resolve_by_device_name() {
    let root = Ext4Builder::new()
        .file("/etc/fstab", b"/dev/hda1 / ext4 defaults 0 1\n/dev/hdb /data ext4 defaults 0 2\n")
        .dir("/data")
        .build();
    let data = Ext4Builder::new().file("/x", b"x").build();
    let volumes = vec![
        physical("disk0p1", root, "ide0:0", 1),
        physical("disk1", data, "ide0:1", 0),
    ];
    let devices = DeviceNameTable::new(["ide0:0", "ide0:1"]);
    let set = mount_volumes(&volumes, &devices, &FsCacheConfig::default()).expect("mount");
    let tree = only_tree(&set);
    assert_eq!(tree.root().spec, "/dev/hda1");
    assert_eq!(tree.read_file("/data/x").expect("whole disk"), b"x");
}

#[test]
fn aufs_volume_is_reported_not_mounted() {
    let mut image = vec![0_u8; 1 << 16];
    image[1024 + 52..1024 + 56].copy_from_slice(&0x1212_1313_u32.to_le_bytes());
    let volumes = vec![physical("disk0", image, "scsi0:0", 0)];
    let set = mount_volumes(&volumes, &DeviceNameTable::default(), &FsCacheConfig::default())
        .expect("mount");
    assert_eq!(set.probe_errors.len(), 1);
    assert_eq!(set.probe_errors[0].0, "disk0");
    assert_eq!(set.unformatted.len(), 1);
}

#[test]
fn invalid_cache_config_is_rejected() {
    let cache = FsCacheConfig {
        inode_capacity: 0,
        block_capacity: 1,
    };
    let err = mount_volumes(&[], &DeviceNameTable::default(), &cache).expect_err("config");
    assert!(matches!(err, VmsError::InvalidConfig(_)));
}

// ── Windows ────────────────────────────────────────────────────────────────

fn windows_set() -> MountSet {
    let system = NtfsBuilder::new()
        .label("System")
        .file("/Windows/System32/config.txt", b"[boot]\r\n")
        .file("/Users/Public/readme.txt", b"public")
        .symlink("/data", r"D:\shared", false)
        .junction("/Documents and Settings", r"C:\Users")
        .build();
    let data = NtfsBuilder::new()
        .label("Data")
        .file("/shared/report.txt", b"q3")
        .symlink("/shared/sys.txt", r"C:\Windows\System32\config.txt", false)
        .build();
    let linux_swap = vec![0_u8; 1 << 16];
    let volumes = vec![
        physical("disk1p1", data, "scsi0:1", 1),
        physical("disk0p1", system, "scsi0:0", 1),
        physical("disk0p2", linux_swap, "scsi0:0", 2),
    ];
    mount_volumes(&volumes, &DeviceNameTable::default(), &FsCacheConfig::default())
        .expect("mount")
}

#[test]
fn windows_root_takes_c_and_others_follow() {
    let set = windows_set();
    let tree = only_tree(&set);
    assert_eq!(tree.os(), GuestOs::Windows);
    let drives: Vec<(&str, &str)> = tree
        .mounts()
        .iter()
        .map(|m| (m.spec.as_str(), m.volume.as_str()))
        .collect();
    assert_eq!(drives, vec![("C:", "disk0p1"), ("D:", "disk1p1")]);
    assert_eq!(tree.volume_name().as_deref(), Some("System"));
}

#[test]
fn windows_paths_take_drive_letters_and_backslashes() {
    let set = windows_set();
    let tree = only_tree(&set);
    for path in [
        r"C:\Windows\System32\config.txt",
        "c:/windows/system32/config.txt",
        "/Windows/System32/config.txt",
        r"\Windows\System32\config.txt",
    ] {
        assert_eq!(tree.read_file(path).expect(path), b"[boot]\r\n");
    }
    assert_eq!(tree.read_file(r"D:\shared\report.txt").expect("d"), b"q3");
    assert_eq!(
        tree.dir_entries("D:").expect("drive root"),
        vec!["shared"]
    );
    assert!(matches!(
        tree.read_file(r"E:\x"),
        Err(VmsError::NotFound(_))
    ));
}

#[test]
fn windows_links_cross_drives() {
    let set = windows_set();
    let tree = only_tree(&set);
    assert_eq!(tree.read_file(r"C:\data\report.txt").expect("c to d"), b"q3");
    assert_eq!(tree.read_file(r"D:\shared\sys.txt").expect("d to c"), b"[boot]\r\n");
    assert_eq!(
        tree.dir_entries(r"C:\Documents and Settings").expect("junction"),
        vec!["Public"]
    );
}

#[test]
fn windows_working_directory() {
    let set = windows_set();
    let tree = only_tree(&set);
    assert_eq!(tree.pwd(), "C:/");
    tree.chdir(r"D:\shared").expect("chdir");
    assert_eq!(tree.pwd(), "D:/shared");
    assert_eq!(tree.read_file("report.txt").expect("relative"), b"q3");
    tree.chdir(r"..\..\..").expect("clamped at drive root");
    assert_eq!(tree.pwd(), "D:/");
    tree.chdir(r"C:\Windows").expect("back to c");
    assert_eq!(tree.read_file(r"System32\config.txt").expect("c relative"), b"[boot]\r\n");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn redundant_separators_and_dots_do_not_matter(
        slashes in proptest::collection::vec(1_usize..4, 2),
        dots in 0_usize..3,
    ) {
        let set = mount_linux();
        let tree = only_tree(&set);
        let sep = |n: usize| "/".repeat(n);
        let path = format!(
            "{}boot{}{}vmlinuz-6.1",
            sep(slashes[0]),
            sep(slashes[1]),
            "./".repeat(dots),
        );
        prop_assert_eq!(tree.read_file(&path).expect("read"), b"kernel".to_vec());
    }
}
