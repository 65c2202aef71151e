#![forbid(unsafe_code)]

use proptest::prelude::*;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use vms_block::{AccessMode, BlobSource, DiskBackend, MemoryBackend};
use vms_disk::{Disk, DiskDescriptor, FormatRegistry, PartitionScheme, Whence};
use vms_error::{Result, VmsError};
use vms_harness::partition::{DosPart, GptPart, LINUX_FS_GUID, extended_chain_disk, gpt_disk, mbr_disk};
use vms_harness::sparse::{SparseExtentBuilder, VhdBuilder, vhd_fixed};
use vms_harness::{SECTOR, pattern};

fn open(desc: &DiskDescriptor) -> Disk {
    Disk::open(desc, &FormatRegistry::default()).expect("open disk")
}

fn memory(bytes: Vec<u8>) -> Arc<dyn DiskBackend> {
    Arc::new(MemoryBackend::new(bytes))
}

fn read_all(disk: &mut Disk, pos: u64, len: usize) -> Vec<u8> {
    disk.seek(i64::try_from(pos).expect("pos"), Whence::Start)
        .expect("seek");
    disk.read(len).expect("read")
}

#[test]
fn raw_image_with_one_linux_partition() {
    const TOTAL: u64 = 64 * 1024 * 1024 / SECTOR as u64;
    const LEN: u32 = 16_384;
    let image = mbr_disk(TOTAL, &[DosPart::new(0x83, 2048, LEN)], 0xDEAD_BEEF);
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(&image).expect("write image");
    file.flush().expect("flush");

    let mut disk = open(&DiskDescriptor::local(file.path()));
    assert_eq!(disk.format(), "file");
    assert_eq!(disk.size(), 64 * 1024 * 1024);
    assert_eq!(disk.disk_signature(), Some(0xDEAD_BEEF));
    let parts = disk.get_partitions().expect("partitions");
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].start_byte(), 2048 * 512);
    assert_eq!(parts[0].end_byte(), (2048 + u64::from(LEN)) * 512);
    assert_eq!(parts[0].partition_type(), 0x83);
    assert_eq!(parts[0].partition_number(), 1);
    disk.close().expect("close");
}

#[test]
fn unpartitioned_disk_has_no_partitions() {
    let mut disk = open(&DiskDescriptor::backend(memory(vec![0; 8192])));
    assert!(disk.get_partitions().expect("partitions").is_empty());
    assert_eq!(disk.partition_scheme().expect("scheme"), PartitionScheme::None);
    assert_eq!(disk.disk_signature(), None);
}

#[test]
fn ldm_disk_is_flagged_with_no_partitions() {
    let image = mbr_disk(64, &[DosPart::new(0x42, 1, 63)], 1);
    let mut disk = open(&DiskDescriptor::backend(memory(image)));
    assert!(disk.get_partitions().expect("partitions").is_empty());
    assert!(disk.is_dynamic_disk().expect("ldm"));
}

#[test]
fn gpt_partitions_use_inclusive_last_lba() {
    let image = gpt_disk(
        256,
        &[
            GptPart {
                type_guid: LINUX_FS_GUID,
                unique_guid: [0x11; 16],
                first_lba: 40,
                last_lba: 99,
                name: "boot".to_owned(),
            },
            GptPart {
                type_guid: LINUX_FS_GUID,
                unique_guid: [0x22; 16],
                first_lba: 100,
                last_lba: 199,
                name: "root".to_owned(),
            },
        ],
    );
    let mut disk = open(&DiskDescriptor::backend(memory(image)));
    let parts = disk.get_partitions().expect("partitions");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].size(), 60 * 512);
    assert_eq!(parts[1].start_byte(), 100 * 512);
    assert_eq!(
        parts[1].partition_entry().and_then(|e| e.name.as_deref()),
        Some("root")
    );
    assert_eq!(disk.partition_scheme().expect("scheme"), PartitionScheme::Gpt);
}

#[test]
fn all_zero_grain_table_reads_zeros() {
    let image = SparseExtentBuilder::new(4096, 128).build();
    let mut disk = open(&DiskDescriptor::backend(memory(image.bytes)));
    assert_eq!(disk.format(), "vmdk-sparse");
    assert_eq!(disk.size(), 4096 * 512);
    let data = read_all(&mut disk, 1000, 200_000);
    assert_eq!(data.len(), 200_000);
    assert!(data.iter().all(|b| *b == 0));
}

#[test]
fn sparse_reads_allocated_and_zeroed_grains() {
    let grain = 16 * SECTOR;
    let image = SparseExtentBuilder::new(1024, 16)
        .grain(1, &pattern(1, grain))
        .grain(5, &pattern(5, grain))
        .zeroed_grain(2)
        .build();
    let mut disk = open(&DiskDescriptor::backend(memory(image.bytes)));
    let data = read_all(&mut disk, grain as u64 - 10, 2 * grain + 20);
    assert!(data[..10].iter().all(|b| *b == 0));
    assert_eq!(&data[10..10 + grain], &pattern(1, grain)[..]);
    assert!(data[10 + grain..].iter().all(|b| *b == 0));
    assert_eq!(read_all(&mut disk, 5 * grain as u64, grain), pattern(5, grain));
}

#[test]
fn footer_located_grain_directory() {
    let grain = 8 * SECTOR;
    let image = SparseExtentBuilder::new(512, 8)
        .grain(3, &pattern(9, grain))
        .with_footer()
        .build();
    let mut disk = open(&DiskDescriptor::backend(memory(image.bytes)));
    assert_eq!(read_all(&mut disk, 3 * grain as u64, grain), pattern(9, grain));
}

#[test]
fn compressed_grains_are_inflated() {
    let grain = 128 * SECTOR;
    let image = SparseExtentBuilder::new(2048, 128)
        .compressed()
        .grain(0, &pattern(2, grain))
        .grain(3, &pattern(3, 100))
        .build();
    let mut disk = open(&DiskDescriptor::backend(memory(image.bytes)));
    assert_eq!(read_all(&mut disk, 0, grain), pattern(2, grain));
    let third = read_all(&mut disk, 3 * grain as u64, grain);
    assert_eq!(&third[..100], &pattern(3, 100)[..]);
    assert!(third[100..].iter().all(|b| *b == 0));
    assert!(!disk.is_writable());
}

#[test]
fn stream_optimized_extent_is_rejected() {
    let image = SparseExtentBuilder::new(1024, 128).with_markers().build();
    let err = Disk::open(
        &DiskDescriptor::backend(memory(image.bytes)),
        &FormatRegistry::default(),
    )
    .expect_err("markers must be rejected");
    assert!(matches!(err, VmsError::UnsupportedFeature(_)), "{err:?}");
}

#[test]
fn vhdx_image_is_refused_instead_of_read_raw() {
    let mut image = b"vhdxfile".to_vec();
    image.resize(1 << 20, 0);
    image[510] = 0x55;
    image[511] = 0xAA;
    let backend = memory(image);
    let err = Disk::open(
        &DiskDescriptor::backend(Arc::clone(&backend)),
        &FormatRegistry::default(),
    )
    .expect_err("vhdx is not a flat disk");
    assert!(matches!(err, VmsError::UnsupportedFeature(_)), "{err:?}");
    assert!(backend.is_closed());
}

#[test]
fn oversized_compressed_grain_is_corruption() {
    let grain = 128 * SECTOR;
    let mut image = SparseExtentBuilder::new(2048, 128)
        .compressed()
        .grain(0, &pattern(4, grain))
        .build();
    let at = image.overhead as usize * SECTOR + 8;
    image.bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    let disk = open(&DiskDescriptor::backend(memory(image.bytes)));
    let mut buf = vec![0_u8; 512];
    let err = disk.read_at(0, &mut buf).expect_err("size past the grain");
    assert!(matches!(err, VmsError::Corruption { .. }), "{err:?}");
}

#[test]
fn write_allocates_grain_with_parent_contents() {
    let grain = 16 * SECTOR;
    let parent_bytes = pattern(0x40, 1024 * SECTOR);
    let child = Arc::new(MemoryBackend::new(SparseExtentBuilder::new(1024, 16).build().bytes));
    let parent = memory(parent_bytes.clone());
    let desc = DiskDescriptor::backend(child.clone())
        .with_mode(AccessMode::ReadWrite)
        .with_parent(DiskDescriptor::backend(Arc::clone(&parent)));
    let mut disk = open(&desc);

    // Unallocated grains fall through to the parent.
    assert_eq!(read_all(&mut disk, 0, 64), parent_bytes[..64].to_vec());

    let at = 2 * grain as u64 + 100;
    disk.seek(i64::try_from(at).expect("at"), Whence::Start)
        .expect("seek");
    assert_eq!(disk.write(b"hello").expect("write"), 5);

    let whole = read_all(&mut disk, 2 * grain as u64, grain);
    let mut expected = parent_bytes[2 * grain..3 * grain].to_vec();
    expected[100..105].copy_from_slice(b"hello");
    assert_eq!(whole, expected);
    // The parent itself is untouched.
    let mut check = [0_u8; 5];
    parent.read_exact_at(at, &mut check).expect("parent read");
    assert_eq!(&check[..], &parent_bytes[at as usize..at as usize + 5]);
    // The child file grew by one grain.
    assert!(child.len_bytes() >= (16 + 16) * SECTOR as u64);
    disk.close().expect("close");
    assert!(parent.is_closed());
}

#[test]
fn writing_a_zeroed_grain_allocates_zero_fill() {
    let grain = 8 * SECTOR;
    let parent = memory(vec![0xFF; 512 * SECTOR]);
    let child = memory(SparseExtentBuilder::new(512, 8).zeroed_grain(1).build().bytes);
    let desc = DiskDescriptor::backend(child)
        .with_mode(AccessMode::ReadWrite)
        .with_parent(DiskDescriptor::backend(parent));
    let mut disk = open(&desc);
    disk.seek(i64::try_from(grain).expect("grain"), Whence::Start)
        .expect("seek");
    disk.write(&[1, 2, 3]).expect("write");
    let data = read_all(&mut disk, grain as u64, grain);
    assert_eq!(&data[..3], &[1, 2, 3]);
    assert!(data[3..].iter().all(|b| *b == 0));
}

#[test]
fn allocation_past_the_grain_limit_is_resource_exhausted() {
    let img = SparseExtentBuilder::new(1024, 16).build();
    let limit = img.overhead + img.grain_count * 16;
    let padded = SparseExtentBuilder::new(1024, 16).file_sectors(limit).build();
    let desc = DiskDescriptor::backend(memory(padded.bytes)).with_mode(AccessMode::ReadWrite);
    let mut disk = open(&desc);
    let err = disk.write(b"x").expect_err("disk full");
    assert!(matches!(err, VmsError::ResourceExhausted(_)), "{err:?}");
}

#[test]
fn base_only_returns_the_parent() {
    let child = memory(SparseExtentBuilder::new(64, 8).grain(0, &[9; 64]).build().bytes);
    let parent = memory(pattern(7, 64 * SECTOR));
    let desc = DiskDescriptor::backend(Arc::clone(&child))
        .with_parent(DiskDescriptor::backend(parent))
        .with_base_only(true);
    let mut disk = open(&desc);
    assert_eq!(disk.format(), "memory");
    assert_eq!(read_all(&mut disk, 0, 16), pattern(7, 16));
    assert!(child.is_closed());
}

#[test]
fn fixed_vhd_exposes_data_without_footer() {
    let data = pattern(4, 8 * SECTOR);
    let mut disk = open(&DiskDescriptor::backend(memory(vhd_fixed(&data))));
    assert_eq!(disk.format(), "window");
    assert_eq!(disk.size(), data.len() as u64);
    assert_eq!(read_all(&mut disk, 0, data.len()), data);
}

#[test]
fn dynamic_vhd_reads_blocks_and_holes() {
    let block = 4096_usize;
    let image = VhdBuilder::dynamic(4 * block as u64, block as u32)
        .block(2, &pattern(6, block))
        .build();
    let desc = DiskDescriptor::backend(memory(image)).with_mode(AccessMode::ReadWrite);
    let mut disk = open(&desc);
    assert_eq!(disk.format(), "vhd-dynamic");
    assert!(read_all(&mut disk, 0, 2 * block).iter().all(|b| *b == 0));
    assert_eq!(read_all(&mut disk, 2 * block as u64, block), pattern(6, block));

    disk.seek(i64::try_from(2 * block + 10).expect("pos"), Whence::Start)
        .expect("seek");
    disk.write(b"abc").expect("write into allocated block");
    assert_eq!(read_all(&mut disk, 2 * block as u64 + 10, 3), b"abc");

    disk.seek(0, Whence::Start).expect("seek");
    let err = disk.write(b"abc").expect_err("no allocation");
    assert!(matches!(err, VmsError::UnsupportedOperation { .. }), "{err:?}");
}

#[test]
fn differencing_vhd_reads_clear_sectors_from_parent() {
    let block = 4096_usize;
    let image = VhdBuilder::differencing(2 * block as u64, block as u32)
        .partial_block(0, &pattern(8, block), &[1])
        .build();
    let parent_bytes = pattern(1, 2 * block);
    let desc = DiskDescriptor::backend(memory(image))
        .with_parent(DiskDescriptor::backend(memory(parent_bytes.clone())));
    let mut disk = open(&desc);
    assert_eq!(disk.format(), "vhd-differencing");
    let data = read_all(&mut disk, 0, 2 * block);
    assert_eq!(&data[..SECTOR], &parent_bytes[..SECTOR]);
    assert_eq!(&data[SECTOR..2 * SECTOR], &pattern(8, block)[SECTOR..2 * SECTOR]);
    assert_eq!(&data[2 * SECTOR..], &parent_bytes[2 * SECTOR..]);
}

#[test]
fn differencing_vhd_without_parent_is_a_config_error() {
    let image = VhdBuilder::differencing(8192, 4096).build();
    let err = Disk::open(&DiskDescriptor::backend(memory(image)), &FormatRegistry::default())
        .expect_err("parent required");
    assert!(matches!(err, VmsError::InvalidConfig(_)), "{err:?}");
}

#[test]
fn raw_flag_skips_format_probing() {
    let image = SparseExtentBuilder::new(64, 8).build();
    let len = image.bytes.len() as u64;
    let mut disk = open(&DiskDescriptor::backend(memory(image.bytes)).with_raw(true));
    assert_eq!(disk.format(), "memory");
    assert_eq!(disk.size(), len);
    assert_eq!(read_all(&mut disk, 0, 4), b"KDMV");
}

#[test]
fn close_twice_is_harmless() {
    let backend = memory(SparseExtentBuilder::new(64, 8).build().bytes);
    let mut disk = open(&DiskDescriptor::backend(Arc::clone(&backend)));
    disk.close().expect("first close");
    disk.close().expect("second close");
    assert!(backend.is_closed());
    assert!(disk.is_closed());
}

#[derive(Debug)]
struct VecBlob {
    bytes: Vec<u8>,
    requests: AtomicU64,
}

impl BlobSource for VecBlob {
    fn locator(&self) -> &str {
        "blob://test/disk.vhd"
    }

    fn content_length(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn read_range(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let start = usize::try_from(offset).expect("offset");
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

#[test]
fn remote_disk_is_cached_and_read_only() {
    let data = pattern(5, 6 * 1024 * 1024);
    let blob = Arc::new(VecBlob {
        bytes: data.clone(),
        requests: AtomicU64::new(0),
    });
    let mut disk = open(&DiskDescriptor::remote(blob.clone()));
    assert_eq!(disk.format(), "remote-blob");
    assert_eq!(read_all(&mut disk, 100, 4096), data[100..4196].to_vec());
    let after_first = blob.requests.load(Ordering::Relaxed);
    assert_eq!(read_all(&mut disk, 200, 1024), data[200..1224].to_vec());
    assert_eq!(blob.requests.load(Ordering::Relaxed), after_first);
    let err = disk.write(b"x").expect_err("read-only");
    assert!(matches!(err, VmsError::UnsupportedOperation { .. }), "{err:?}");
    disk.close().expect("close");
}

#[test]
fn remote_disk_cannot_be_opened_read_write() {
    let blob = Arc::new(VecBlob {
        bytes: vec![0; 1024],
        requests: AtomicU64::new(0),
    });
    let desc = DiskDescriptor::remote(blob).with_mode(AccessMode::ReadWrite);
    assert!(matches!(
        Disk::open(&desc, &FormatRegistry::default()),
        Err(VmsError::InvalidConfig(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn extended_chains_are_fully_discovered(depth in 1_usize..=8, sectors in 1_u32..15) {
        let (image, expected) = extended_chain_disk(depth, sectors);
        let mut disk = open(&DiskDescriptor::backend(memory(image)));
        let parts = disk.get_partitions().expect("partitions");
        prop_assert_eq!(parts.len(), depth);
        for (i, (part, (start, len))) in parts.iter().zip(&expected).enumerate() {
            prop_assert_eq!(part.partition_number(), 5 + i as u32);
            prop_assert_eq!(part.start_byte(), start * 512);
            prop_assert_eq!(part.size(), len * 512);
        }
    }

    #[test]
    fn sparse_reads_match_grain_model(
        shift in 3_u32..=7,
        allocated in proptest::collection::btree_set(0_u64..16, 0..8),
        offset in 0_u64..(16 * 8 * 512),
        len in 1_usize..(3 * 128 * 512),
    ) {
        let grain_size = 1_u64 << shift;
        let grain = (grain_size as usize) * SECTOR;
        let capacity = 16 * grain_size;
        let mut builder = SparseExtentBuilder::new(capacity, grain_size);
        let mut model = vec![0_u8; 16 * grain];
        for &g in &allocated {
            let data = pattern(g as u8, grain);
            model[g as usize * grain..(g as usize + 1) * grain].copy_from_slice(&data);
            builder = builder.grain(g, &data);
        }
        let mut disk = open(&DiskDescriptor::backend(memory(builder.build().bytes)));
        let offset = offset % model.len() as u64;
        let want = len.min(model.len() - offset as usize);
        let got = read_all(&mut disk, offset, len);
        prop_assert_eq!(got.len(), want);
        prop_assert_eq!(&got[..], &model[offset as usize..offset as usize + want]);
    }

    #[test]
    fn raw_file_round_trips_writes(offset in 0_u64..60_000, data in proptest::collection::vec(any::<u8>(), 1..4096)) {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        file.as_file().set_len(64 * 1024).expect("set_len");
        let desc = DiskDescriptor::local(file.path())
            .with_mode(AccessMode::ReadWrite)
            .with_raw(true);
        let mut disk = open(&desc);
        disk.seek(i64::try_from(offset).expect("offset"), Whence::Start).expect("seek");
        let written = disk.write(&data).expect("write");
        prop_assert_eq!(written, data.len());
        prop_assert_eq!(read_all(&mut disk, offset, data.len()), data);
        disk.close().expect("close");
    }
}
