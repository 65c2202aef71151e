//! Small NTFS volumes.
//!
//! Geometry: 512-byte sectors, 4 KiB clusters, 1 KiB MFT records and
//! 4 KiB index records. The MFT occupies 8 clusters from cluster 4, so the
//! volume holds at most 32 records; user files start at record 16. Data
//! clusters follow the MFT in allocation order, with the `$Bitmap` data
//! last and 16 free clusters at the end of the volume.

use std::collections::BTreeMap;

use crate::{place, put_le};

pub const CLUSTER: usize = 4096;
pub const RECORD: usize = 1024;
pub const INDEX_RECORD: usize = 4096;
pub const MFT_LCN: u64 = 4;
pub const MFT_CLUSTERS: u64 = 8;
pub const MAX_RECORDS: u64 = MFT_CLUSTERS * (CLUSTER / RECORD) as u64;
pub const FREE_CLUSTERS: u64 = 16;
pub const ROOT_RECORD: u64 = 5;
const FIRST_USER_RECORD: u64 = 16;
/// Sequence number stamped on every record and file reference.
const SEQ: u64 = 1;
/// Entries per leaf index record before a directory gets another one.
const LEAF_ENTRIES: usize = 16;
/// Directories with more children than this use `$INDEX_ALLOCATION`.
const ROOT_ENTRIES: usize = 4;
const RESIDENT_LIMIT: usize = 600;

pub const DEFAULT_UNIX_TIME: u64 = 1_700_000_000;

const AT_STANDARD_INFORMATION: u32 = 0x10;
const AT_ATTRIBUTE_LIST: u32 = 0x20;
const AT_FILE_NAME: u32 = 0x30;
const AT_VOLUME_NAME: u32 = 0x60;
const AT_VOLUME_INFORMATION: u32 = 0x70;
const AT_DATA: u32 = 0x80;
const AT_INDEX_ROOT: u32 = 0x90;
const AT_INDEX_ALLOCATION: u32 = 0xA0;
const AT_BITMAP: u32 = 0xB0;
const AT_REPARSE_POINT: u32 = 0xC0;

pub const ATTR_COMPRESSED: u16 = 0x0001;
pub const ATTR_ENCRYPTED: u16 = 0x4000;
const FILE_ATTR_HIDDEN_SYSTEM: u32 = 0x0006;
const FILE_ATTR_ARCHIVE: u32 = 0x0020;
const FILE_ATTR_REPARSE: u32 = 0x0400;
const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;

const NAMESPACE_WIN32: u8 = 1;
const NAMESPACE_DOS: u8 = 2;
const NAMESPACE_BOTH: u8 = 3;

/// NT timestamp (100 ns ticks since 1601) of a Unix time.
#[must_use]
pub fn nt_time(unix: u64) -> u64 {
    (unix + 11_644_473_600) * 10_000_000
}

fn file_ref(record: u64) -> u64 {
    (SEQ << 48) | record
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

#[derive(Debug, Clone)]
struct FileSpec {
    size: u64,
    /// `(starting VCN, bytes)`; uncovered clusters are sparse.
    chunks: Vec<(u64, Vec<u8>)>,
    attr_flags: u16,
    /// Keep `$DATA` in an extension record reached through `$ATTRIBUTE_LIST`.
    extension: bool,
}

#[derive(Debug, Clone)]
enum Kind {
    Dir,
    File(FileSpec),
    Symlink { target: String, relative: bool },
    Junction(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: u64,
    name: String,
    dos: Option<String>,
    kind: Kind,
}

#[derive(Debug, Clone)]
pub struct NtfsBuilder {
    label: String,
    serial: u64,
    nodes: BTreeMap<u64, Node>,
    paths: BTreeMap<String, u64>,
    next_record: u64,
}

impl Default for NtfsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NtfsBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_RECORD,
            Node {
                parent: ROOT_RECORD,
                name: ".".to_owned(),
                dos: None,
                kind: Kind::Dir,
            },
        );
        let mut paths = BTreeMap::new();
        paths.insert("/".to_owned(), ROOT_RECORD);
        Self {
            label: String::new(),
            serial: 0x0123_4567_89AB_CDEF,
            nodes,
            paths,
            next_record: FIRST_USER_RECORD,
        }
    }

    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_owned();
        self
    }

    #[must_use]
    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    #[must_use]
    pub fn dir(mut self, path: &str) -> Self {
        self.ensure_dir(path);
        self
    }

    #[must_use]
    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.flagged_file(path, data, 0)
    }

    /// File whose `$DATA` carries attribute `flags` (compressed, encrypted).
    #[must_use]
    pub fn flagged_file(mut self, path: &str, data: &[u8], flags: u16) -> Self {
        self.insert(
            path,
            Kind::File(FileSpec {
                size: data.len() as u64,
                chunks: vec![(0, data.to_vec())],
                attr_flags: flags,
                extension: false,
            }),
        );
        self
    }

    /// Non-resident file of `size` bytes with data only at the given VCNs.
    #[must_use]
    pub fn sparse_file(mut self, path: &str, size: u64, chunks: &[(u64, &[u8])]) -> Self {
        self.insert(
            path,
            Kind::File(FileSpec {
                size,
                chunks: chunks.iter().map(|(vcn, d)| (*vcn, d.to_vec())).collect(),
                attr_flags: 0,
                extension: false,
            }),
        );
        self
    }

    /// File whose `$DATA` lives in an extension record.
    #[must_use]
    pub fn extension_file(mut self, path: &str, data: &[u8]) -> Self {
        self.insert(
            path,
            Kind::File(FileSpec {
                size: data.len() as u64,
                chunks: vec![(0, data.to_vec())],
                attr_flags: 0,
                extension: true,
            }),
        );
        self
    }

    #[must_use]
    pub fn symlink(mut self, path: &str, target: &str, relative: bool) -> Self {
        self.insert(
            path,
            Kind::Symlink {
                target: target.to_owned(),
                relative,
            },
        );
        self
    }

    #[must_use]
    pub fn junction(mut self, path: &str, target: &str) -> Self {
        self.insert(path, Kind::Junction(target.to_owned()));
        self
    }

    /// Give `path` an 8.3 alias indexed under the DOS namespace.
    #[must_use]
    pub fn dos_alias(mut self, path: &str, alias: &str) -> Self {
        let record = self.paths[path];
        if let Some(node) = self.nodes.get_mut(&record) {
            node.dos = Some(alias.to_owned());
        }
        self
    }

    #[must_use]
    pub fn record(&self, path: &str) -> Option<u64> {
        self.paths.get(path).copied()
    }

    fn ensure_dir(&mut self, path: &str) -> u64 {
        let key = path.trim_end_matches('/');
        if key.is_empty() {
            return ROOT_RECORD;
        }
        if let Some(record) = self.paths.get(key) {
            return *record;
        }
        self.insert(key, Kind::Dir)
    }

    fn insert(&mut self, path: &str, kind: Kind) -> u64 {
        let key = path.trim_end_matches('/');
        let (parent_path, name) = key.rsplit_once('/').unwrap_or(("", key));
        let parent = self.ensure_dir(parent_path);
        let record = self.next_record;
        self.next_record += 1;
        self.nodes.insert(
            record,
            Node {
                parent,
                name: name.to_owned(),
                dos: None,
                kind,
            },
        );
        self.paths.insert(key.to_owned(), record);
        record
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0_u8; (MFT_LCN + MFT_CLUSTERS) as usize * CLUSTER];
        let mut alloc = ClusterAlloc {
            next: MFT_LCN + MFT_CLUSTERS,
        };
        let mut records: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut next_extension = self.next_record;

        let time = nt_time(DEFAULT_UNIX_TIME);
        for (&number, node) in &self.nodes {
            let is_dir = matches!(node.kind, Kind::Dir | Kind::Junction(_));
            let mut file_attrs = if is_dir { 0 } else { FILE_ATTR_ARCHIVE };
            if matches!(node.kind, Kind::Symlink { .. } | Kind::Junction(_)) {
                file_attrs |= FILE_ATTR_REPARSE;
            }
            let mut attrs = vec![standard_information(time, file_attrs)];
            let size = match &node.kind {
                Kind::File(spec) => spec.size,
                _ => 0,
            };
            let fn_flags = file_attrs | if is_dir { FILE_ATTR_DIRECTORY } else { 0 };
            let long_ns = if node.dos.is_some() {
                NAMESPACE_WIN32
            } else {
                NAMESPACE_BOTH
            };
            let mut names = vec![file_name(node.parent, &node.name, long_ns, fn_flags, size, time)];
            if let Some(dos) = &node.dos {
                names.push(file_name(node.parent, dos, NAMESPACE_DOS, fn_flags, size, time));
            }

            match &node.kind {
                Kind::Dir => {
                    attrs.extend(names.iter().map(|n| resident(AT_FILE_NAME, "", n, 0)));
                    attrs.extend(self.directory_index(number, &mut image, &mut alloc));
                }
                Kind::Junction(target) => {
                    attrs.extend(names.iter().map(|n| resident(AT_FILE_NAME, "", n, 0)));
                    attrs.push(index_root(&[], false));
                    attrs.push(resident(AT_REPARSE_POINT, "", &reparse(0xA000_0003, target, None), 0));
                }
                Kind::Symlink { target, relative } => {
                    attrs.extend(names.iter().map(|n| resident(AT_FILE_NAME, "", n, 0)));
                    attrs.push(resident(AT_DATA, "", &[], 0));
                    let flags = Some(u32::from(*relative));
                    attrs.push(resident(AT_REPARSE_POINT, "", &reparse(0xA000_000C, target, flags), 0));
                }
                Kind::File(spec) => {
                    let data = data_attribute(spec, &mut image, &mut alloc);
                    if spec.extension {
                        let ext = next_extension;
                        next_extension += 1;
                        let mut list = Vec::new();
                        list.extend(attribute_list_entry(AT_STANDARD_INFORMATION, number, 0));
                        for (i, _) in names.iter().enumerate() {
                            list.extend(attribute_list_entry(AT_FILE_NAME, number, 1 + i as u16));
                        }
                        list.extend(attribute_list_entry(AT_DATA, ext, 0));
                        attrs.push(resident(AT_ATTRIBUTE_LIST, "", &list, 0));
                        attrs.extend(names.iter().map(|n| resident(AT_FILE_NAME, "", n, 0)));
                        records.push((ext, mft_record(ext, 0x1, file_ref(number), &[data])));
                    } else {
                        attrs.extend(names.iter().map(|n| resident(AT_FILE_NAME, "", n, 0)));
                        attrs.push(data);
                    }
                }
            }
            let flags = if is_dir { 0x3 } else { 0x1 };
            records.push((number, mft_record(number, flags, 0, &attrs)));
        }
        assert!(next_extension <= MAX_RECORDS, "MFT full");

        // $MFT, $Volume and $Bitmap; the bitmap is allocated last so it can
        // count every cluster before it.
        let mft_runs = runlist(&[(MFT_CLUSTERS, Some(MFT_LCN))]);
        let mft_size = MFT_CLUSTERS * CLUSTER as u64;
        records.push((
            0,
            mft_record(
                0,
                0x1,
                0,
                &[
                    standard_information(time, FILE_ATTR_HIDDEN_SYSTEM),
                    resident(AT_FILE_NAME, "", &meta_name("$MFT", mft_size, time), 0),
                    non_resident(AT_DATA, "", &mft_runs, MFT_CLUSTERS, mft_size, 0),
                ],
            ),
        ));
        let mut info = vec![0_u8; 12];
        info[8] = 3;
        info[9] = 1;
        records.push((
            3,
            mft_record(
                3,
                0x1,
                0,
                &[
                    standard_information(time, FILE_ATTR_HIDDEN_SYSTEM),
                    resident(AT_FILE_NAME, "", &meta_name("$Volume", 0, time), 0),
                    resident(AT_VOLUME_NAME, "", &utf16(&self.label), 0),
                    resident(AT_VOLUME_INFORMATION, "", &info, 0),
                ],
            ),
        ));
        let bitmap_lcn = alloc.next;
        let total = bitmap_lcn + 1 + FREE_CLUSTERS;
        let mut bitmap = vec![0_u8; CLUSTER];
        for lcn in 0..=bitmap_lcn {
            bitmap[(lcn / 8) as usize] |= 1 << (lcn % 8);
        }
        let bitmap_len = total.div_ceil(8).next_multiple_of(8);
        alloc.write(&mut image, &bitmap);
        records.push((
            6,
            mft_record(
                6,
                0x1,
                0,
                &[
                    standard_information(time, FILE_ATTR_HIDDEN_SYSTEM),
                    resident(AT_FILE_NAME, "", &meta_name("$Bitmap", bitmap_len, time), 0),
                    non_resident(AT_DATA, "", &runlist(&[(1, Some(bitmap_lcn))]), 1, bitmap_len, 0),
                ],
            ),
        ));

        image.resize(total as usize * CLUSTER, 0);
        for (number, record) in records {
            let at = MFT_LCN as usize * CLUSTER + number as usize * RECORD;
            image[at..at + RECORD].copy_from_slice(&record);
        }
        place(&mut image, 0, &self.boot_sector(total));
        image
    }

    fn boot_sector(&self, total_clusters: u64) -> Vec<u8> {
        let mut b = vec![0_u8; 512];
        b[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        b[3..11].copy_from_slice(b"NTFS    ");
        put_le(&mut b, 0x0B, 512, 2);
        b[0x0D] = (CLUSTER / 512) as u8;
        b[0x15] = 0xF8;
        put_le(&mut b, 0x28, total_clusters * (CLUSTER / 512) as u64, 8);
        put_le(&mut b, 0x30, MFT_LCN, 8);
        put_le(&mut b, 0x38, 2, 8);
        b[0x40] = 0xF6; // 2^10 = 1 KiB records
        b[0x44] = 1;
        put_le(&mut b, 0x48, self.serial, 8);
        b[510] = 0x55;
        b[511] = 0xAA;
        b
    }

    /// `$INDEX_ROOT` plus, for larger directories, `$INDEX_ALLOCATION` and
    /// its `$BITMAP`.
    fn directory_index(&self, dir: u64, image: &mut Vec<u8>, alloc: &mut ClusterAlloc) -> Vec<Vec<u8>> {
        let time = nt_time(DEFAULT_UNIX_TIME);
        let mut keys: Vec<(String, u64, Vec<u8>)> = Vec::new();
        if dir == ROOT_RECORD {
            for (name, record) in [("$MFT", 0), ("$Volume", 3), ("$Bitmap", 6)] {
                keys.push((name.to_uppercase(), record, meta_name(name, 0, time)));
            }
        }
        for (&record, node) in self.nodes.iter().filter(|(r, n)| n.parent == dir && **r != dir) {
            let is_dir = matches!(node.kind, Kind::Dir | Kind::Junction(_));
            let mut flags = if is_dir { FILE_ATTR_DIRECTORY } else { FILE_ATTR_ARCHIVE };
            if matches!(node.kind, Kind::Symlink { .. } | Kind::Junction(_)) {
                flags |= FILE_ATTR_REPARSE;
            }
            let size = match &node.kind {
                Kind::File(spec) => spec.size,
                _ => 0,
            };
            let ns = if node.dos.is_some() {
                NAMESPACE_WIN32
            } else {
                NAMESPACE_BOTH
            };
            keys.push((
                node.name.to_uppercase(),
                record,
                file_name(dir, &node.name, ns, flags, size, time),
            ));
            if let Some(dos) = &node.dos {
                keys.push((
                    dos.to_uppercase(),
                    record,
                    file_name(dir, dos, NAMESPACE_DOS, flags, size, time),
                ));
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        if keys.len() <= ROOT_ENTRIES {
            let entries: Vec<Vec<u8>> = keys
                .iter()
                .map(|(_, record, key)| index_entry(file_ref(*record), Some(key.as_slice()), None, false))
                .collect();
            return vec![index_root(&entries, false)];
        }

        // Leaves of up to LEAF_ENTRIES keys; the last key of every leaf but
        // the final one moves up into the root as a separator.
        let chunks: Vec<&[(String, u64, Vec<u8>)]> = keys.chunks(LEAF_ENTRIES).collect();
        let mut root_entries = Vec::new();
        let mut leaves = Vec::new();
        for (vcn, chunk) in chunks.iter().enumerate() {
            let last_chunk = vcn + 1 == chunks.len();
            let (leaf_keys, separator) = if last_chunk {
                (&chunk[..], None)
            } else {
                (&chunk[..chunk.len() - 1], chunk.last())
            };
            let entries: Vec<Vec<u8>> = leaf_keys
                .iter()
                .map(|(_, record, key)| index_entry(file_ref(*record), Some(key.as_slice()), None, false))
                .collect();
            leaves.push(index_record(vcn as u64, &entries));
            if let Some((_, record, key)) = separator {
                root_entries.push(index_entry(file_ref(*record), Some(key.as_slice()), Some(vcn as u64), false));
            } else {
                root_entries.push(index_entry(0, None, Some(vcn as u64), true));
            }
        }
        let leaf_count = leaves.len() as u64;
        let lcn = alloc.write(image, &leaves.concat());
        let mut bitmap = vec![0_u8; 8];
        for i in 0..leaf_count {
            bitmap[(i / 8) as usize] |= 1 << (i % 8);
        }
        let alloc_size = leaf_count * INDEX_RECORD as u64;
        vec![
            index_root_raw(&root_entries, true),
            non_resident(
                AT_INDEX_ALLOCATION,
                "$I30",
                &runlist(&[(leaf_count, Some(lcn))]),
                leaf_count,
                alloc_size,
                0,
            ),
            resident(AT_BITMAP, "$I30", &bitmap, 0),
        ]
    }
}

struct ClusterAlloc {
    next: u64,
}

impl ClusterAlloc {
    fn write(&mut self, image: &mut Vec<u8>, data: &[u8]) -> u64 {
        let n = data.len().div_ceil(CLUSTER).max(1) as u64;
        let lcn = self.next;
        place(image, lcn as usize * CLUSTER, data);
        let end = (lcn + n) as usize * CLUSTER;
        if image.len() < end {
            image.resize(end, 0);
        }
        self.next += n;
        lcn
    }
}

fn data_attribute(spec: &FileSpec, image: &mut Vec<u8>, alloc: &mut ClusterAlloc) -> Vec<u8> {
    let dense = spec.chunks.len() == 1 && spec.chunks[0].0 == 0 && spec.chunks[0].1.len() as u64 == spec.size;
    if dense && spec.size as usize <= RESIDENT_LIMIT && spec.attr_flags == 0 {
        return resident(AT_DATA, "", &spec.chunks[0].1, 0);
    }
    let total_vcns = spec.size.div_ceil(CLUSTER as u64);
    let mut chunks = spec.chunks.clone();
    chunks.sort_by_key(|c| c.0);
    let mut runs = Vec::new();
    let mut vcn = 0;
    for (start, data) in &chunks {
        if *start > vcn {
            runs.push((start - vcn, None));
        }
        let n = data.len().div_ceil(CLUSTER).max(1) as u64;
        let lcn = alloc.write(image, data);
        runs.push((n, Some(lcn)));
        vcn = start + n;
    }
    if total_vcns > vcn {
        runs.push((total_vcns - vcn, None));
    }
    non_resident(AT_DATA, "", &runlist(&runs), total_vcns.max(vcn), spec.size, spec.attr_flags)
}

/// Encode a mapping-pairs array with minimal field widths.
#[must_use]
pub fn runlist(runs: &[(u64, Option<u64>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev: i64 = 0;
    for (length, lcn) in runs {
        let len_bytes = unsigned_bytes(*length);
        let delta = lcn.map(|l| {
            let d = l as i64 - prev;
            prev = l as i64;
            signed_bytes(d)
        });
        let off_len = delta.as_ref().map_or(0, Vec::len);
        out.push(((off_len as u8) << 4) | len_bytes.len() as u8);
        out.extend(len_bytes);
        if let Some(d) = delta {
            out.extend(d);
        }
    }
    out.push(0);
    out
}

fn unsigned_bytes(v: u64) -> Vec<u8> {
    let mut bytes = v.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 {
        bytes.pop();
    }
    bytes
}

fn signed_bytes(v: i64) -> Vec<u8> {
    let mut bytes = v.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let top = bytes[bytes.len() - 1];
        let next_sign = bytes[bytes.len() - 2] & 0x80;
        if (top == 0 && next_sign == 0) || (top == 0xFF && next_sign != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

fn standard_information(time: u64, file_attrs: u32) -> Vec<u8> {
    let mut v = vec![0_u8; 0x48];
    put_le(&mut v, 0x00, time, 8);
    put_le(&mut v, 0x08, time + 20_000_000, 8);
    put_le(&mut v, 0x10, time + 30_000_000, 8);
    put_le(&mut v, 0x18, time + 10_000_000, 8);
    put_le(&mut v, 0x20, u64::from(file_attrs), 4);
    resident(AT_STANDARD_INFORMATION, "", &v, 0)
}

fn file_name(parent: u64, name: &str, namespace: u8, flags: u32, size: u64, time: u64) -> Vec<u8> {
    let encoded = utf16(name);
    let mut v = vec![0_u8; 0x42];
    put_le(&mut v, 0x00, file_ref(parent), 8);
    for at in [0x08, 0x10, 0x18, 0x20] {
        put_le(&mut v, at, time, 8);
    }
    put_le(&mut v, 0x28, size.next_multiple_of(CLUSTER as u64), 8);
    put_le(&mut v, 0x30, size, 8);
    put_le(&mut v, 0x38, u64::from(flags), 4);
    v[0x40] = (encoded.len() / 2) as u8;
    v[0x41] = namespace;
    v.extend(encoded);
    v
}

fn meta_name(name: &str, size: u64, time: u64) -> Vec<u8> {
    file_name(ROOT_RECORD, name, NAMESPACE_BOTH, FILE_ATTR_HIDDEN_SYSTEM, size, time)
}

fn attribute_list_entry(type_code: u32, record: u64, id: u16) -> Vec<u8> {
    let mut e = vec![0_u8; 0x20];
    put_le(&mut e, 0x00, u64::from(type_code), 4);
    put_le(&mut e, 0x04, 0x20, 2);
    e[0x07] = 0x1A;
    put_le(&mut e, 0x10, file_ref(record), 8);
    put_le(&mut e, 0x18, u64::from(id), 2);
    e
}

fn reparse(tag: u32, target: &str, symlink_flags: Option<u32>) -> Vec<u8> {
    let substitute = utf16(&format!(r"\??\{target}"));
    let print = utf16(target);
    let mut data = vec![0_u8; 8];
    put_le(&mut data, 0, 0, 2);
    put_le(&mut data, 2, substitute.len() as u64, 2);
    put_le(&mut data, 4, substitute.len() as u64, 2);
    put_le(&mut data, 6, print.len() as u64, 2);
    if let Some(flags) = symlink_flags {
        data.extend(flags.to_le_bytes());
    }
    data.extend(substitute);
    data.extend(print);
    let mut v = vec![0_u8; 8];
    put_le(&mut v, 0, u64::from(tag), 4);
    put_le(&mut v, 4, data.len() as u64, 2);
    v.extend(data);
    v
}

fn index_entry(file_ref: u64, key: Option<&[u8]>, subnode: Option<u64>, last: bool) -> Vec<u8> {
    let key_len = key.map_or(0, <[u8]>::len);
    let mut len = (0x10 + key_len + 7) & !7;
    if subnode.is_some() {
        len += 8;
    }
    let mut e = vec![0_u8; len];
    put_le(&mut e, 0, file_ref, 8);
    put_le(&mut e, 8, len as u64, 2);
    put_le(&mut e, 10, key_len as u64, 2);
    let flags = u64::from(subnode.is_some()) | (u64::from(last) << 1);
    put_le(&mut e, 12, flags, 4);
    if let Some(key) = key {
        e[0x10..0x10 + key.len()].copy_from_slice(key);
    }
    if let Some(vcn) = subnode {
        put_le(&mut e, len - 8, vcn, 8);
    }
    e
}

fn index_root(entries: &[Vec<u8>], large: bool) -> Vec<u8> {
    let mut all = entries.to_vec();
    all.push(index_entry(0, None, None, true));
    index_root_raw(&all, large)
}

/// `$INDEX_ROOT` over fully formed entries, terminator included.
fn index_root_raw(entries: &[Vec<u8>], large: bool) -> Vec<u8> {
    let body = entries.concat();
    let mut v = vec![0_u8; 0x20];
    put_le(&mut v, 0x00, u64::from(AT_FILE_NAME), 4);
    put_le(&mut v, 0x04, 1, 4);
    put_le(&mut v, 0x08, INDEX_RECORD as u64, 4);
    v[0x0C] = 1;
    put_le(&mut v, 0x10, 0x10, 4);
    put_le(&mut v, 0x14, (0x10 + body.len()) as u64, 4);
    put_le(&mut v, 0x18, (0x10 + body.len()) as u64, 4);
    v[0x1C] = u8::from(large);
    v.extend(body);
    resident(AT_INDEX_ROOT, "$I30", &v, 0)
}

/// One `INDX` leaf holding `entries` plus the terminator.
fn index_record(vcn: u64, entries: &[Vec<u8>]) -> Vec<u8> {
    let mut r = vec![0_u8; INDEX_RECORD];
    r[0..4].copy_from_slice(b"INDX");
    put_le(&mut r, 0x04, 0x28, 2);
    put_le(&mut r, 0x06, (1 + INDEX_RECORD / 512) as u64, 2);
    put_le(&mut r, 0x10, vcn, 8);
    let mut body = entries.concat();
    body.extend(index_entry(0, None, None, true));
    let entries_at = 0x40;
    assert!(entries_at + body.len() <= INDEX_RECORD - 2, "index record overflow");
    put_le(&mut r, 0x18, (entries_at - 0x18) as u64, 4);
    put_le(&mut r, 0x1C, (entries_at - 0x18 + body.len()) as u64, 4);
    put_le(&mut r, 0x20, (INDEX_RECORD - 0x18) as u64, 4);
    r[entries_at..entries_at + body.len()].copy_from_slice(&body);
    protect(&mut r, 0x28);
    r
}

fn resident(type_code: u32, name: &str, value: &[u8], flags: u16) -> Vec<u8> {
    let name = utf16(name);
    let value_offset = (0x18 + name.len() + 7) & !7;
    let len = (value_offset + value.len() + 7) & !7;
    let mut a = vec![0_u8; len];
    put_le(&mut a, 0, u64::from(type_code), 4);
    put_le(&mut a, 4, len as u64, 4);
    a[9] = (name.len() / 2) as u8;
    put_le(&mut a, 0x0A, 0x18, 2);
    put_le(&mut a, 0x0C, u64::from(flags), 2);
    put_le(&mut a, 0x10, value.len() as u64, 4);
    put_le(&mut a, 0x14, value_offset as u64, 2);
    a[0x18..0x18 + name.len()].copy_from_slice(&name);
    a[value_offset..value_offset + value.len()].copy_from_slice(value);
    a
}

fn non_resident(type_code: u32, name: &str, runs: &[u8], vcns: u64, data_size: u64, flags: u16) -> Vec<u8> {
    let name = utf16(name);
    let runs_offset = (0x40 + name.len() + 7) & !7;
    let len = (runs_offset + runs.len() + 7) & !7;
    let mut a = vec![0_u8; len];
    put_le(&mut a, 0, u64::from(type_code), 4);
    put_le(&mut a, 4, len as u64, 4);
    a[8] = 1;
    a[9] = (name.len() / 2) as u8;
    put_le(&mut a, 0x0A, 0x40, 2);
    put_le(&mut a, 0x0C, u64::from(flags), 2);
    put_le(&mut a, 0x18, vcns.saturating_sub(1), 8);
    put_le(&mut a, 0x20, runs_offset as u64, 2);
    if flags & ATTR_COMPRESSED != 0 {
        put_le(&mut a, 0x22, 4, 2);
    }
    put_le(&mut a, 0x28, vcns * CLUSTER as u64, 8);
    put_le(&mut a, 0x30, data_size, 8);
    put_le(&mut a, 0x38, data_size, 8);
    a[0x40..0x40 + name.len()].copy_from_slice(&name);
    a[runs_offset..runs_offset + runs.len()].copy_from_slice(runs);
    a
}

fn mft_record(number: u64, flags: u16, base: u64, attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut r = vec![0_u8; RECORD];
    r[0..4].copy_from_slice(b"FILE");
    put_le(&mut r, 0x04, 0x30, 2);
    put_le(&mut r, 0x06, (1 + RECORD / 512) as u64, 2);
    put_le(&mut r, 0x10, SEQ, 2);
    put_le(&mut r, 0x12, 1, 2);
    put_le(&mut r, 0x14, 0x38, 2);
    put_le(&mut r, 0x16, u64::from(flags), 2);
    put_le(&mut r, 0x1C, RECORD as u64, 4);
    put_le(&mut r, 0x20, base, 8);
    put_le(&mut r, 0x28, attrs.len() as u64, 2);
    put_le(&mut r, 0x2C, number, 4);
    let mut at = 0x38;
    for (id, attr) in attrs.iter().enumerate() {
        assert!(at + attr.len() + 8 <= RECORD - 2, "record {number} overflow");
        r[at..at + attr.len()].copy_from_slice(attr);
        put_le(&mut r, at + 0x0E, id as u64, 2);
        at += attr.len();
    }
    put_le(&mut r, at, 0xFFFF_FFFF, 4);
    put_le(&mut r, 0x18, (at + 8) as u64, 4);
    protect(&mut r, 0x30);
    r
}

/// Move each sector's last two bytes into the update sequence array and
/// stamp the sequence number in their place.
fn protect(record: &mut [u8], usa_offset: usize) {
    let usn = [0x01, 0x00];
    record[usa_offset..usa_offset + 2].copy_from_slice(&usn);
    for i in 1..=record.len() / 512 {
        let end = i * 512;
        let saved = [record[end - 2], record[end - 1]];
        record[usa_offset + i * 2..usa_offset + i * 2 + 2].copy_from_slice(&saved);
        record[end - 2..end].copy_from_slice(&usn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le16(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    #[test]
    fn runlist_encodes_sparse_and_negative_runs() {
        let bytes = runlist(&[(4, Some(0x1000)), (2, None), (3, Some(0x0FF0))]);
        assert_eq!(
            bytes,
            vec![0x21, 0x04, 0x00, 0x10, 0x01, 0x02, 0x11, 0x03, 0xF0, 0x00]
        );
    }

    #[test]
    fn signed_widths_keep_sign_bit() {
        assert_eq!(signed_bytes(0x80), vec![0x80, 0x00]);
        assert_eq!(signed_bytes(-1), vec![0xFF]);
        assert_eq!(signed_bytes(-0x81), vec![0x7F, 0xFF]);
    }

    #[test]
    fn records_carry_fixups() {
        let r = mft_record(16, 1, 0, &[]);
        assert_eq!(&r[0..4], b"FILE");
        assert_eq!(le16(&r, 510), 1);
        assert_eq!(le16(&r, 1022), 1);
    }

    #[test]
    fn boot_sector_and_root_record() {
        let image = NtfsBuilder::new().label("System").file("/a.txt", b"a").build();
        assert_eq!(&image[3..7], b"NTFS");
        let root = (MFT_LCN as usize) * CLUSTER + ROOT_RECORD as usize * RECORD;
        assert_eq!(&image[root..root + 4], b"FILE");
        assert_eq!(image.len() % CLUSTER, 0);
    }

    #[test]
    fn large_directories_spill_into_index_records() {
        let mut builder = NtfsBuilder::new();
        for i in 0..20 {
            builder = builder.file(&format!("/dir/file{i:02}"), b"x");
        }
        let image = builder.build();
        let indx = (MFT_LCN + MFT_CLUSTERS) as usize * CLUSTER;
        assert!(image.windows(4).skip(indx).any(|w| w == b"INDX"));
    }
}
