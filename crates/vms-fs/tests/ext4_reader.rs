use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use proptest::prelude::*;
use vms_block::{DiskBackend, MemoryBackend};
use vms_error::VmsError;
use vms_fs::{Ext4Fs, FileKind, FileSystem, FsCacheConfig, NtfsFs, probe_filesystem};
use vms_harness::ext4::{DEFAULT_TIME, Ext4Builder};
use vms_harness::ntfs::NtfsBuilder;
use vms_harness::pattern;

fn mount(image: Vec<u8>) -> Ext4Fs {
    Ext4Fs::open("sda1", Arc::new(MemoryBackend::new(image)), &FsCacheConfig::default())
        .expect("open ext4")
}

fn linux_root() -> Ext4Builder {
    Ext4Builder::new()
        .label("rootfs")
        .file("/etc/fstab", b"/dev/sda1 / ext4 defaults 0 1\n")
        .file("/etc/hostname", b"vm1\n")
        .symlink("/etc/localtime", "/usr/share/zoneinfo/UTC")
        .file("/usr/share/zoneinfo/UTC", b"TZif2")
        .dir("/var/log")
        .symlink("/lib", "usr/lib")
        .file("/usr/lib/os-release", b"ID=debian\n")
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[test]
fn lists_directories_and_reads_files() {
    let fs = mount(linux_root().build());
    assert_eq!(fs.fs_type(), "ext4");
    assert_eq!(fs.volume_name().as_deref(), Some("rootfs"));
    assert_eq!(fs.fs_id(), "5a5a5a5a-5a5a-5a5a-5a5a-5a5a5a5a5a5a");
    assert_eq!(
        sorted(fs.dir_entries("/").expect("root")),
        vec!["etc", "lib", "usr", "var"]
    );
    assert_eq!(
        sorted(fs.dir_entries("/etc").expect("etc")),
        vec!["fstab", "hostname", "localtime"]
    );
    assert_eq!(fs.read_file("/etc/hostname").expect("hostname"), b"vm1\n");
    assert!(fs.is_dir("/var/log").expect("is_dir"));
    assert!(fs.is_file("/etc/fstab").expect("is_file"));
}

#[test]
fn symlinks_resolve_absolute_and_relative() {
    let fs = mount(linux_root().build());
    assert!(fs.is_symlink("/etc/localtime").expect("is_symlink"));
    assert_eq!(
        fs.read_link("/etc/localtime").expect("link"),
        "/usr/share/zoneinfo/UTC"
    );
    assert!(fs.is_file("/etc/localtime").expect("follows link"));
    assert_eq!(fs.read_file("/etc/localtime").expect("via link"), b"TZif2");
    assert_eq!(
        fs.read_file("/lib/os-release").expect("relative link"),
        b"ID=debian\n"
    );
    assert_eq!(fs.stat("/lib").expect("lstat").kind, FileKind::Symlink);
    assert_eq!(
        fs.stat_follow("/lib").expect("stat").kind,
        FileKind::Directory
    );
}

#[test]
fn long_symlink_target_lives_in_a_block() {
    let target = format!("/opt/{}/bin/tool", "x".repeat(80));
    let fs = mount(Ext4Builder::new().symlink("/usr/bin/tool", &target).build());
    assert_eq!(fs.read_link("/usr/bin/tool").expect("slow link"), target);
}

#[test]
fn chdir_makes_paths_relative() {
    let fs = mount(linux_root().build());
    assert_eq!(fs.pwd(), "/");
    fs.chdir("/lib").expect("chdir through link");
    assert_eq!(fs.pwd(), "/usr/lib");
    assert_eq!(fs.read_file("os-release").expect("relative"), b"ID=debian\n");
    assert_eq!(
        fs.read_file("../../etc/hostname").expect("dotdot"),
        b"vm1\n"
    );
    assert!(matches!(
        fs.chdir("/etc/hostname"),
        Err(VmsError::NotDirectory(_))
    ));
    assert_eq!(fs.pwd(), "/usr/lib");
}

#[test]
fn lookup_failures_are_typed() {
    let fs = mount(linux_root().build());
    assert!(matches!(fs.stat("/nope"), Err(VmsError::NotFound(_))));
    assert!(!fs.exists("/etc/nope").expect("exists"));
    assert!(matches!(fs.open("/etc"), Err(VmsError::IsDirectory(_))));
    assert!(matches!(
        fs.dir_entries("/etc/hostname"),
        Err(VmsError::NotDirectory(_))
    ));
    assert!(matches!(
        fs.read_link("/etc/hostname"),
        Err(VmsError::NotSymlink(_))
    ));
}

#[test]
fn stat_reports_mode_size_and_times() {
    let builder = linux_root();
    let ino = builder.ino("/etc/fstab").expect("ino");
    let fs = mount(builder.build());
    let st = fs.stat("/etc/fstab").expect("stat");
    assert_eq!(st.kind, FileKind::File);
    assert_eq!(st.mode, 0o100_644);
    assert_eq!(st.size, 30);
    assert_eq!(st.node_id, u64::from(ino));
    let t = i64::from(DEFAULT_TIME);
    assert_eq!((st.atime, st.ctime, st.mtime), (t, t + 1, t + 2));
    assert_eq!(fs.stat("/").expect("root").mode & 0o170_000, 0o040_000);
}

#[test]
fn holes_read_as_zeros() {
    let size = 5 * 4096 + 100;
    let fs = mount(
        Ext4Builder::new()
            .sparse_file("/var/sparse", size, &[(1, &b"middle"[..]), (5, &b"tail"[..])], &[(3, 1)])
            .build(),
    );
    let data = fs.read_file("/var/sparse").expect("read");
    assert_eq!(data.len() as u64, size);
    assert!(data[..4096].iter().all(|b| *b == 0));
    assert_eq!(&data[4096..4102], b"middle");
    assert!(data[3 * 4096..4 * 4096].iter().all(|b| *b == 0));
    assert_eq!(&data[5 * 4096..5 * 4096 + 4], b"tail");
}

#[test]
fn extent_index_nodes_are_followed() {
    let body = pattern(7, 6 * 4096 + 17);
    let fs = mount(Ext4Builder::new().indexed_file("/data.bin", &body).build());
    assert_eq!(fs.read_file("/data.bin").expect("indexed"), body);
}

#[test]
fn ext2_indirect_blocks() {
    let body = pattern(3, 40 * 1024 + 5);
    let fs = mount(
        Ext4Builder::ext2()
            .file("/boot/vmlinuz", &body)
            .symlink("/vmlinuz", "boot/vmlinuz")
            .build(),
    );
    assert_eq!(fs.superblock().block_size, 1024);
    assert_eq!(fs.read_file("/vmlinuz").expect("indirect"), body);
}

#[test]
fn metadata_checksums_and_dirty_state_still_open() {
    let fs = mount(
        Ext4Builder::new()
            .metadata_csum()
            .state(0x0002)
            .file("/etc/hostname", b"csum\n")
            .build(),
    );
    assert!(fs.superblock().has_errors());
    assert_eq!(fs.read_file("/etc/hostname").expect("read"), b"csum\n");
}

#[test]
fn free_bytes_come_from_the_superblock() {
    let fs = mount(linux_root().build());
    let sb = fs.superblock();
    assert_eq!(
        fs.free_bytes().expect("free"),
        sb.free_blocks_count * u64::from(sb.block_size)
    );
    assert!(fs.free_bytes().expect("free") > 0);
}

#[test]
fn file_handle_reads_and_seeks() {
    let body = pattern(9, 3 * 4096);
    let fs = mount(Ext4Builder::new().file("/f", &body).build());
    let mut file = fs.open("/f").expect("open");
    assert_eq!(file.len(), body.len() as u64);
    file.seek(SeekFrom::Start(4090)).expect("seek");
    let mut buf = [0_u8; 12];
    file.read_exact(&mut buf).expect("read across blocks");
    assert_eq!(&buf, &body[4090..4102]);
    file.seek(SeekFrom::End(0)).expect("seek end");
    assert_eq!(file.read(&mut buf).expect("eof"), 0);
}

#[test]
fn probe_chain_picks_the_right_reader() {
    let cache = FsCacheConfig::default();
    let ext: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(linux_root().build()));
    let ntfs: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(NtfsBuilder::new().build()));

    let fs = probe_filesystem("ext", Arc::clone(&ext), &cache)
        .expect("probe")
        .expect("ext4 detected");
    assert_eq!(fs.fs_type(), "ext4");
    let fs = probe_filesystem("ntfs", Arc::clone(&ntfs), &cache)
        .expect("probe")
        .expect("ntfs detected");
    assert_eq!(fs.fs_type(), "ntfs");

    assert!(NtfsFs::probe("ext", ext, &cache).expect("probe").is_none());
    assert!(Ext4Fs::probe("ntfs", ntfs, &cache).expect("probe").is_none());
}

#[test]
fn corrupt_superblock_is_not_a_match() {
    let mut image = linux_root().build();
    // s_inodes_per_group = 0
    image[1024 + 0x28..1024 + 0x2C].fill(0);
    let dev: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(image));
    assert!(
        Ext4Fs::probe("bad", dev, &FsCacheConfig::default())
            .expect("probe")
            .is_none()
    );
}

#[test]
fn closed_volume_propagates() {
    let dev = Arc::new(MemoryBackend::new(linux_root().build()));
    dev.close().expect("close");
    let err = Ext4Fs::probe("closed", dev, &FsCacheConfig::default()).expect_err("closed");
    assert!(matches!(err, VmsError::Closed(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn read_at_matches_file_contents(
        len in 1_usize..(4 * 4096),
        offset in 0_u64..(5 * 4096),
        count in 0_usize..9000,
    ) {
        let body = pattern(11, len);
        let fs = mount(Ext4Builder::new().file("/p", &body).build());
        let file = fs.open("/p").expect("open");
        let mut buf = vec![0_u8; count];
        let n = file.read_at(offset, &mut buf).expect("read_at");
        let start = (offset as usize).min(len);
        let expected = &body[start..(start + count).min(len)];
        prop_assert_eq!(&buf[..n], expected);
    }
}
