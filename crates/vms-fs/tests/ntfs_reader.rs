use std::sync::Arc;

use vms_block::MemoryBackend;
use vms_error::VmsError;
use vms_fs::{FileKind, FileSystem, FsCacheConfig, NtfsFs};
use vms_harness::ntfs::{
    ATTR_COMPRESSED, ATTR_ENCRYPTED, CLUSTER, DEFAULT_UNIX_TIME, FREE_CLUSTERS, NtfsBuilder,
};
use vms_harness::pattern;

fn mount(builder: &NtfsBuilder) -> NtfsFs {
    NtfsFs::open(
        "sda2",
        Arc::new(MemoryBackend::new(builder.build())),
        &FsCacheConfig::default(),
    )
    .expect("open ntfs")
}

fn windows_volume() -> NtfsBuilder {
    NtfsBuilder::new()
        .label("System")
        .file("/Windows/System32/config.txt", b"[boot]\r\n")
        .file("/Users/Public/big.bin", &pattern(1, 3 * CLUSTER + 10))
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

#[test]
fn volume_identity() {
    let fs = mount(&windows_volume().serial(0x0123_4567_89AB_CDEF));
    assert_eq!(fs.fs_type(), "ntfs");
    assert_eq!(fs.volume_name().as_deref(), Some("System"));
    assert_eq!(fs.fs_id(), "89AB-CDEF");
    assert_eq!(
        fs.free_bytes().expect("free"),
        FREE_CLUSTERS * CLUSTER as u64
    );
}

#[test]
fn metafiles_are_hidden_from_listings() {
    let fs = mount(&windows_volume());
    assert_eq!(
        sorted(fs.dir_entries("/").expect("root")),
        vec!["Users", "Windows"]
    );
    assert!(fs.exists("/$MFT").expect("metafile lookup"));
}

#[test]
fn resident_and_non_resident_data() {
    let fs = mount(&windows_volume());
    assert_eq!(
        fs.read_file("/Windows/System32/config.txt").expect("resident"),
        b"[boot]\r\n"
    );
    assert_eq!(
        fs.read_file("/Users/Public/big.bin").expect("non-resident"),
        pattern(1, 3 * CLUSTER + 10)
    );
}

#[test]
fn lookup_ignores_case() {
    let fs = mount(&windows_volume());
    assert_eq!(
        fs.read_file("/windows/SYSTEM32/Config.TXT").expect("case"),
        b"[boot]\r\n"
    );
    fs.chdir("/WINDOWS").expect("chdir");
    assert_eq!(fs.pwd(), "/WINDOWS");
    assert!(fs.is_dir("system32").expect("relative"));
}

#[test]
fn stat_uses_standard_information() {
    let builder = windows_volume();
    let record = builder.record("/Users/Public/big.bin").expect("record");
    let fs = mount(&builder);
    let st = fs.stat("/Users/Public/big.bin").expect("stat");
    assert_eq!(st.kind, FileKind::File);
    assert_eq!(st.size, 3 * CLUSTER as u64 + 10);
    assert_eq!(st.mode, 0o100_644);
    assert_eq!(st.node_id, record);
    let t = DEFAULT_UNIX_TIME as i64;
    assert_eq!((st.atime, st.mtime, st.ctime), (t + 1, t + 2, t + 3));
    assert_eq!(fs.stat("/Users").expect("dir").kind, FileKind::Directory);
}

#[test]
fn sparse_runs_read_as_zeros() {
    let tail = pattern(4, CLUSTER);
    let fs = mount(&NtfsBuilder::new().sparse_file(
        "/sparse.dat",
        4 * CLUSTER as u64,
        &[(2, tail.as_slice())],
    ));
    let data = fs.read_file("/sparse.dat").expect("sparse");
    assert_eq!(data.len(), 4 * CLUSTER);
    assert!(data[..2 * CLUSTER].iter().all(|b| *b == 0));
    assert_eq!(&data[2 * CLUSTER..3 * CLUSTER], tail.as_slice());
    assert!(data[3 * CLUSTER..].iter().all(|b| *b == 0));
}

#[test]
fn data_in_an_extension_record() {
    let body = pattern(6, 2 * CLUSTER);
    let fs = mount(&NtfsBuilder::new().extension_file("/pagefile.sys", &body));
    assert_eq!(
        fs.stat("/pagefile.sys").expect("stat").size,
        body.len() as u64
    );
    assert_eq!(fs.read_file("/pagefile.sys").expect("extension"), body);
}

#[test]
fn dos_aliases_resolve_but_are_not_listed() {
    let fs = mount(
        &NtfsBuilder::new()
            .file("/Program Files/app.exe", b"MZ")
            .dos_alias("/Program Files", "PROGRA~1"),
    );
    assert_eq!(fs.dir_entries("/").expect("root"), vec!["Program Files"]);
    assert_eq!(fs.read_file("/progra~1/app.exe").expect("alias"), b"MZ");
}

#[test]
fn large_directory_spans_index_records() {
    let mut builder = NtfsBuilder::new();
    for i in 0..14 {
        builder = builder.file(&format!("/file{i:02}.txt"), format!("body {i}").as_bytes());
    }
    let fs = mount(&builder);
    let names = sorted(fs.dir_entries("/").expect("root"));
    assert_eq!(names.len(), 14);
    assert_eq!(names[0], "file00.txt");
    assert_eq!(names[13], "file13.txt");
    for i in [0, 7, 13] {
        assert_eq!(
            fs.read_file(&format!("/file{i:02}.txt")).expect("read"),
            format!("body {i}").as_bytes()
        );
    }
}

#[test]
fn symlinks_and_junctions() {
    let fs = mount(
        &windows_volume()
            .symlink("/sys32", r"C:\Windows\System32", false)
            .symlink("/Windows/cfg", r"System32\config.txt", true)
            .junction("/Documents and Settings", r"C:\Users"),
    );
    assert!(fs.is_symlink("/sys32").expect("symlink"));
    assert_eq!(fs.read_link("/sys32").expect("target"), "C:/Windows/System32");
    assert_eq!(fs.dir_entries("/sys32").expect("follow"), vec!["config.txt"]);
    assert_eq!(fs.read_file("/Windows/cfg").expect("relative"), b"[boot]\r\n");

    assert_eq!(
        fs.stat("/Documents and Settings").expect("lstat").kind,
        FileKind::Symlink
    );
    assert_eq!(
        fs.dir_entries("/Documents and Settings").expect("junction"),
        vec!["Public"]
    );
    assert!(matches!(
        fs.read_link("/Windows"),
        Err(VmsError::NotSymlink(_))
    ));
}

#[test]
fn compressed_and_encrypted_streams_are_refused() {
    let body = pattern(2, CLUSTER);
    let fs = mount(
        &NtfsBuilder::new()
            .flagged_file("/c.bin", &body, ATTR_COMPRESSED)
            .flagged_file("/e.bin", &body, ATTR_ENCRYPTED),
    );
    assert!(matches!(
        fs.open("/c.bin"),
        Err(VmsError::UnsupportedFeature(_))
    ));
    assert!(matches!(
        fs.open("/e.bin"),
        Err(VmsError::UnsupportedFeature(_))
    ));
    assert_eq!(fs.stat("/c.bin").expect("stat").size, CLUSTER as u64);
}

#[test]
fn missing_paths_and_directories() {
    let fs = mount(&windows_volume());
    assert!(matches!(
        fs.open("/Windows/nope.dll"),
        Err(VmsError::NotFound(_))
    ));
    assert!(matches!(fs.open("/Windows"), Err(VmsError::IsDirectory(_))));
    assert!(matches!(
        fs.dir_entries("/Windows/System32/config.txt"),
        Err(VmsError::NotDirectory(_))
    ));
}
