//! NTFS reader.
//!
//! The MFT is located from the boot sector and read through its own
//! `$DATA` run list. Parsed file records, with `$ATTRIBUTE_LIST`
//! extensions merged in, are kept in an LRU cache; so are decoded `INDX`
//! records. Compressed and encrypted streams are refused.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vms_block::{DiskBackend, LruCache};
use vms_error::{Result, VmsError};
use vms_ondisk::ntfs::{
    AT_ATTRIBUTE_LIST, AT_DATA, AT_INDEX_ALLOCATION, AT_INDEX_ROOT, AT_REPARSE_POINT,
    AT_STANDARD_INFORMATION, AT_VOLUME_NAME, AttributeBody, DataRun, FILE_ATTR_READONLY,
    IndexEntry, IndexRoot, MFT_FIRST_USER_RECORD, MFT_RECORD_BITMAP, MFT_RECORD_MFT,
    MFT_RECORD_ROOT, MFT_RECORD_VOLUME, MftRecord, MftRecordHeader, NtfsAttribute, NtfsBootSector,
    ReparsePoint, StandardInformation, apply_fixups, file_ref_record, nt_time_to_unix,
    parse_attribute_list, parse_index_record, parse_volume_name,
};
use vms_types::{ParseError, parse_error_to_vms};

use crate::path::{self, Namespace};
use crate::{FileData, FileKind, FileStat, FileSystem, FsCacheConfig, FsFile};

/// Directory index B-tree levels walked before the index is declared
/// corrupt.
const MAX_INDEX_DEPTH: usize = 16;
const INDEX_NAME: &str = "$I30";
/// Index VCNs count 512-byte blocks when index records are smaller than a
/// cluster.
const SMALL_INDEX_VCN_UNIT: u64 = 512;

#[derive(Debug)]
pub struct NtfsFs {
    inner: Arc<NtfsInner>,
    cwd: Mutex<String>,
}

#[derive(Debug)]
struct NtfsInner {
    name: String,
    dev: Arc<dyn DiskBackend>,
    boot: NtfsBootSector,
    cluster_size: u64,
    record_size: u64,
    mft: Stream,
    records: Mutex<LruCache<u64, Arc<NtfsNode>>>,
    index_records: Mutex<LruCache<(u64, u64), Arc<Vec<IndexEntry>>>>,
    volume_name: Option<String>,
    free_bytes: OnceLock<u64>,
}

/// One file: its base record header and every attribute, extension
/// records included.
#[derive(Debug)]
struct NtfsNode {
    record: u64,
    header: MftRecordHeader,
    attrs: Vec<NtfsAttribute>,
}

impl NtfsNode {
    fn attr(&self, type_code: u32, name: &str) -> Option<&NtfsAttribute> {
        self.attrs
            .iter()
            .find(|attr| attr.type_code == type_code && attr.name == name)
    }

    fn has_reparse_point(&self) -> bool {
        self.attr(AT_REPARSE_POINT, "").is_some()
    }
}

// ── streams ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RunExtent {
    vcn: u64,
    length: u64,
    lcn: Option<u64>,
}

#[derive(Debug, Clone)]
enum StreamBody {
    Resident(Arc<Vec<u8>>),
    Runs(Vec<RunExtent>),
}

/// Attribute value addressed by byte offset.
#[derive(Debug, Clone)]
struct Stream {
    size: u64,
    /// Bytes past this point read as zeros.
    initialized: u64,
    body: StreamBody,
}

impl Stream {
    fn from_attribute(attr: &NtfsAttribute, what: &str) -> Result<Self> {
        if attr.is_compressed() {
            return Err(VmsError::UnsupportedFeature(format!(
                "compressed NTFS stream: {what}"
            )));
        }
        if attr.is_encrypted() {
            return Err(VmsError::UnsupportedFeature(format!(
                "encrypted NTFS stream: {what}"
            )));
        }
        Ok(match &attr.body {
            AttributeBody::Resident(value) => Self {
                size: value.len() as u64,
                initialized: value.len() as u64,
                body: StreamBody::Resident(Arc::new(value.clone())),
            },
            AttributeBody::NonResident {
                start_vcn,
                data_size,
                initialized_size,
                runs,
                ..
            } => Self {
                size: *data_size,
                initialized: (*initialized_size).min(*data_size),
                body: StreamBody::Runs(run_extents(*start_vcn, runs)),
            },
        })
    }

    fn find_run(runs: &[RunExtent], vcn: u64) -> Option<RunExtent> {
        let idx = runs.partition_point(|run| run.vcn <= vcn);
        let run = runs.get(idx.checked_sub(1)?)?;
        (vcn < run.vcn + run.length).then_some(*run)
    }
}

fn run_extents(start_vcn: u64, runs: &[DataRun]) -> Vec<RunExtent> {
    let mut vcn = start_vcn;
    runs.iter()
        .map(|run| {
            let extent = RunExtent {
                vcn,
                length: run.length,
                lcn: run.lcn,
            };
            vcn += run.length;
            extent
        })
        .collect()
}

/// Join non-resident fragments of the same attribute that were split
/// across records. Sizes come from the fragment starting at VCN 0.
fn merge_fragments(attrs: Vec<NtfsAttribute>) -> Vec<NtfsAttribute> {
    let mut out: Vec<NtfsAttribute> = Vec::with_capacity(attrs.len());
    let mut fragments: Vec<NtfsAttribute> = Vec::new();
    for attr in attrs {
        match attr.body {
            AttributeBody::NonResident { .. } => fragments.push(attr),
            AttributeBody::Resident(_) => out.push(attr),
        }
    }
    fragments.sort_by_key(|attr| match attr.body {
        AttributeBody::NonResident { start_vcn, .. } => start_vcn,
        AttributeBody::Resident(_) => 0,
    });
    for frag in fragments {
        let existing = out.iter_mut().find(|a| {
            a.type_code == frag.type_code && a.name == frag.name && !a.is_resident()
        });
        let Some(base) = existing else {
            out.push(frag);
            continue;
        };
        if let (
            AttributeBody::NonResident {
                last_vcn, runs, ..
            },
            AttributeBody::NonResident {
                start_vcn: frag_start,
                last_vcn: frag_last,
                runs: frag_runs,
                ..
            },
        ) = (&mut base.body, frag.body)
        {
            let next = *last_vcn + 1;
            if frag_start > next {
                runs.push(DataRun {
                    length: frag_start - next,
                    lcn: None,
                });
            }
            runs.extend(frag_runs);
            *last_vcn = (*last_vcn).max(frag_last);
        }
    }
    out
}

// ── volume ─────────────────────────────────────────────────────────────────

impl NtfsFs {
    /// Open `dev` as NTFS, returning `None` when it is not one.
    pub fn probe(
        name: &str,
        dev: Arc<dyn DiskBackend>,
        cache: &FsCacheConfig,
    ) -> Result<Option<Self>> {
        if dev.len_bytes() < 512 {
            return Ok(None);
        }
        let mut sector = [0_u8; 512];
        dev.read_exact_at(0, &mut sector)?;
        if !NtfsBootSector::has_oem_id(&sector) {
            return Ok(None);
        }
        match Self::open(name, dev, cache) {
            Ok(fs) => Ok(Some(fs)),
            Err(err @ (VmsError::Io(_) | VmsError::Closed(_) | VmsError::InvalidConfig(_))) => {
                Err(err)
            }
            Err(err) => {
                debug!(volume = name, error = %err, "ntfs probe rejected volume");
                Ok(None)
            }
        }
    }

    pub fn open(name: &str, dev: Arc<dyn DiskBackend>, cache: &FsCacheConfig) -> Result<Self> {
        let mut sector = [0_u8; 512];
        dev.read_exact_at(0, &mut sector)?;
        let boot =
            NtfsBootSector::parse(&sector).map_err(|e| parse_error_to_vms("NTFS boot sector", &e))?;
        let cluster_size = boot.cluster_size();
        let record_size = boot.mft_record_size();
        if !cluster_size.is_power_of_two() || !(512..=4096).contains(&record_size) {
            return Err(VmsError::Format(format!(
                "{name}: unsupported NTFS geometry (cluster {cluster_size}, record {record_size})"
            )));
        }

        // Record 0 describes the MFT itself; bootstrap from its first
        // cluster.
        let mft_offset = boot
            .mft_lcn
            .checked_mul(cluster_size)
            .ok_or_else(|| VmsError::corruption("NTFS boot sector", "MFT offset overflow"))?;
        let mut raw = vec![0_u8; record_size as usize];
        dev.read_exact_at(mft_offset, &mut raw)?;
        let mft_record = decode_record(&raw, name, MFT_RECORD_MFT)?;
        let mft_data = mft_record
            .find(AT_DATA, "")
            .ok_or_else(|| VmsError::corruption(format!("{name} $MFT"), "no $DATA attribute"))?;
        let mft = Stream::from_attribute(mft_data, "$MFT")?;

        let mut inner = NtfsInner {
            name: name.to_owned(),
            dev,
            cluster_size,
            record_size,
            mft,
            records: Mutex::new(LruCache::new(cache.inode_capacity)?),
            index_records: Mutex::new(LruCache::new(cache.block_capacity)?),
            volume_name: None,
            free_bytes: OnceLock::new(),
            boot,
        };
        let root = inner.load(MFT_RECORD_ROOT)?;
        if !root.header.is_directory() {
            return Err(VmsError::corruption(
                format!("{name} root record"),
                "not a directory",
            ));
        }
        inner.volume_name = match inner.read_volume_name() {
            Ok(label) => label,
            Err(err) => {
                warn!(volume = name, error = %err, "cannot read NTFS volume name");
                None
            }
        };
        info!(
            volume = name,
            serial = %inner.boot.serial_string(),
            cluster_size,
            clusters = inner.boot.total_clusters(),
            "opened ntfs filesystem"
        );
        Ok(Self {
            inner: Arc::new(inner),
            cwd: Mutex::new("/".to_owned()),
        })
    }

    #[must_use]
    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.inner.boot
    }

    fn resolve(&self, path: &str, follow_final: bool) -> Result<path::Resolved<Arc<NtfsNode>>> {
        let cwd = self.cwd.lock().clone();
        path::resolve(self.inner.as_ref(), &cwd, path, follow_final)
    }
}

fn decode_record(raw: &[u8], volume: &str, number: u64) -> Result<MftRecord> {
    let context = || format!("{volume} MFT record {number}");
    let mut raw = raw.to_vec();
    apply_fixups(&mut raw).map_err(|e| parse_error_to_vms(context(), &e))?;
    MftRecord::parse(&raw).map_err(|e| parse_error_to_vms(context(), &e))
}

impl NtfsInner {
    fn parse_err(&self, what: &str, err: &ParseError) -> VmsError {
        parse_error_to_vms(format!("{} {what}", self.name), err)
    }

    fn read_stream(&self, stream: &Stream, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= stream.size {
            return Ok(0);
        }
        let to_read = usize::try_from((stream.size - offset).min(buf.len() as u64))
            .unwrap_or(buf.len());
        let runs = match &stream.body {
            StreamBody::Resident(value) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(value.len());
                let n = to_read.min(value.len() - start);
                buf[..n].copy_from_slice(&value[start..start + n]);
                buf[n..to_read].fill(0);
                return Ok(to_read);
            }
            StreamBody::Runs(runs) => runs,
        };
        let cs = self.cluster_size;
        let mut done = 0_usize;
        while done < to_read {
            let pos = offset + done as u64;
            let remaining = to_read - done;
            if pos >= stream.initialized {
                buf[done..to_read].fill(0);
                break;
            }
            let vcn = pos / cs;
            let within = pos % cs;
            let run = Stream::find_run(runs, vcn);
            let run_left = run.map_or(cs - within, |r| (r.vcn + r.length - vcn) * cs - within);
            let chunk = usize::try_from(run_left.min(stream.initialized - pos))
                .unwrap_or(remaining)
                .min(remaining);
            let out = &mut buf[done..done + chunk];
            match run.and_then(|r| r.lcn.map(|lcn| lcn + (vcn - r.vcn))) {
                Some(lcn) => {
                    let address = lcn
                        .checked_mul(cs)
                        .and_then(|a| a.checked_add(within))
                        .ok_or_else(|| {
                            VmsError::corruption(format!("{} run list", self.name), "LCN overflow")
                        })?;
                    self.dev.read_exact_at(address, out)?;
                }
                None => out.fill(0),
            }
            done += chunk;
        }
        Ok(to_read)
    }

    fn read_whole(&self, stream: &Stream) -> Result<Vec<u8>> {
        let len = usize::try_from(stream.size).map_err(|_| {
            VmsError::ResourceExhausted(format!("{}: attribute too large", self.name))
        })?;
        let mut buf = vec![0_u8; len];
        let n = self.read_stream(stream, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn attr_value(&self, attr: &NtfsAttribute) -> Result<Vec<u8>> {
        match attr.resident_value() {
            Some(value) => Ok(value.to_vec()),
            None => self.read_whole(&Stream::from_attribute(attr, "attribute value")?),
        }
    }

    fn read_record(&self, number: u64) -> Result<MftRecord> {
        let offset = number.checked_mul(self.record_size).ok_or_else(|| {
            VmsError::corruption(format!("{} MFT", self.name), "record offset overflow")
        })?;
        if offset + self.record_size > self.mft.size {
            return Err(VmsError::corruption(
                format!("{} MFT", self.name),
                format!("record {number} beyond the MFT"),
            ));
        }
        let mut raw = vec![0_u8; self.record_size as usize];
        self.read_stream(&self.mft, offset, &mut raw)?;
        decode_record(&raw, &self.name, number)
    }

    /// File `number` with extension records merged; cached.
    fn load(&self, number: u64) -> Result<Arc<NtfsNode>> {
        if let Some(hit) = self.records.lock().get_cloned(&number) {
            return Ok(hit);
        }
        let base = self.read_record(number)?;
        if !base.header.in_use() {
            return Err(VmsError::NotFound(format!("MFT record {number} not in use")));
        }
        let mut attrs = base.attributes.clone();
        if let Some(list_attr) = base.find(AT_ATTRIBUTE_LIST, "") {
            let list = parse_attribute_list(&self.attr_value(list_attr)?)
                .map_err(|e| self.parse_err("attribute list", &e))?;
            let mut extensions: Vec<u64> = list
                .iter()
                .map(|entry| file_ref_record(entry.file_ref))
                .filter(|rec| *rec != number)
                .collect();
            extensions.sort_unstable();
            extensions.dedup();
            for ext in extensions {
                let record = self.read_record(ext)?;
                if file_ref_record(record.header.base_record) != number {
                    warn!(volume = %self.name, record = number, extension = ext,
                        "extension record does not point back at its base");
                    continue;
                }
                attrs.extend(record.attributes);
            }
        }
        let node = Arc::new(NtfsNode {
            record: number,
            header: base.header,
            attrs: merge_fragments(attrs),
        });
        self.records.lock().insert(number, Arc::clone(&node));
        Ok(node)
    }

    fn read_volume_name(&self) -> Result<Option<String>> {
        let volume = self.load(MFT_RECORD_VOLUME)?;
        Ok(volume
            .attr(AT_VOLUME_NAME, "")
            .and_then(NtfsAttribute::resident_value)
            .map(parse_volume_name)
            .filter(|label| !label.is_empty()))
    }

    fn free_bytes(&self) -> Result<u64> {
        if let Some(free) = self.free_bytes.get() {
            return Ok(*free);
        }
        let bitmap_node = self.load(MFT_RECORD_BITMAP)?;
        let data = bitmap_node.attr(AT_DATA, "").ok_or_else(|| {
            VmsError::corruption(format!("{} $Bitmap", self.name), "no $DATA attribute")
        })?;
        let bitmap = self.read_whole(&Stream::from_attribute(data, "$Bitmap")?)?;
        let total = self.boot.total_clusters();
        let mut free_clusters = 0_u64;
        for lcn in 0..total {
            let Some(byte) = bitmap.get((lcn / 8) as usize) else {
                break;
            };
            if byte & (1 << (lcn % 8)) == 0 {
                free_clusters += 1;
            }
        }
        let free = free_clusters * self.cluster_size;
        let _ = self.free_bytes.set(free);
        Ok(free)
    }

    // ── directory indexes ──────────────────────────────────────────────

    /// Every keyed `$I30` entry of `dir`, in collation order.
    fn index_entries(&self, dir: &NtfsNode) -> Result<Vec<IndexEntry>> {
        let root_attr = dir.attr(AT_INDEX_ROOT, INDEX_NAME).ok_or_else(|| {
            VmsError::NotDirectory(format!("MFT record {}", dir.record))
        })?;
        let root = IndexRoot::parse(&self.attr_value(root_attr)?)
            .map_err(|e| self.parse_err("index root", &e))?;
        let allocation = dir
            .attr(AT_INDEX_ALLOCATION, INDEX_NAME)
            .map(|attr| Stream::from_attribute(attr, "$INDEX_ALLOCATION"))
            .transpose()?;
        let walker = IndexWalker {
            fs: self,
            dir: dir.record,
            record_size: u64::from(root.index_record_size),
            allocation,
        };
        let mut out = Vec::new();
        walker.walk(&root.entries, 0, &mut out)?;
        Ok(out)
    }

    /// User-visible `(name, record)` pairs of `dir`.
    fn list_dir(&self, dir: &NtfsNode) -> Result<Vec<(String, u64)>> {
        Ok(self
            .index_entries(dir)?
            .into_iter()
            .filter_map(|entry| {
                let key = entry.key?;
                let record = file_ref_record(entry.file_ref);
                let hidden = key.is_dos_only()
                    || record == dir.record
                    || (record < MFT_FIRST_USER_RECORD && key.name.starts_with('$'));
                (!hidden).then_some((key.name, record))
            })
            .collect())
    }

    fn reparse_point(&self, node: &NtfsNode) -> Result<Option<ReparsePoint>> {
        let Some(attr) = node.attr(AT_REPARSE_POINT, "") else {
            return Ok(None);
        };
        let value = self.attr_value(attr)?;
        ReparsePoint::parse(&value)
            .map(Some)
            .map_err(|e| self.parse_err("reparse point", &e))
    }

    /// Link target as stored, with `/` separators.
    fn link_target(&self, node: &NtfsNode) -> Result<Option<String>> {
        Ok(match self.reparse_point(node)? {
            Some(ReparsePoint::Symlink { target, .. } | ReparsePoint::Junction { target }) => {
                Some(target.replace('\\', "/"))
            }
            Some(ReparsePoint::Other { .. }) | None => None,
        })
    }

    fn stat(&self, node: &NtfsNode) -> Result<FileStat> {
        let si = match node.attr(AT_STANDARD_INFORMATION, "") {
            Some(attr) => Some(
                StandardInformation::parse(&self.attr_value(attr)?)
                    .map_err(|e| self.parse_err("standard information", &e))?,
            ),
            None => None,
        };
        let is_link = node.has_reparse_point() && self.link_target(node)?.is_some();
        let kind = if is_link {
            FileKind::Symlink
        } else if node.header.is_directory() {
            FileKind::Directory
        } else {
            FileKind::File
        };
        let readonly = si
            .as_ref()
            .is_some_and(|si| si.file_attributes & FILE_ATTR_READONLY != 0);
        let mode = match kind {
            FileKind::Directory => 0o040_755,
            FileKind::Symlink => 0o120_777,
            _ if readonly => 0o100_444,
            _ => 0o100_644,
        };
        let size = match kind {
            FileKind::File => node.attr(AT_DATA, "").map_or(0, NtfsAttribute::value_len),
            FileKind::Symlink => self.link_target(node)?.map_or(0, |t| t.len() as u64),
            _ => 0,
        };
        let time = |pick: fn(&StandardInformation) -> u64| {
            si.as_ref().map_or(0, |si| nt_time_to_unix(pick(si)))
        };
        Ok(FileStat {
            kind,
            size,
            mode,
            atime: time(|si| si.access_time),
            mtime: time(|si| si.modification_time),
            ctime: time(|si| si.mft_change_time),
            node_id: node.record,
        })
    }
}

struct IndexWalker<'a> {
    fs: &'a NtfsInner,
    dir: u64,
    record_size: u64,
    allocation: Option<Stream>,
}

impl IndexWalker<'_> {
    fn walk(&self, entries: &[IndexEntry], depth: usize, out: &mut Vec<IndexEntry>) -> Result<()> {
        if depth > MAX_INDEX_DEPTH {
            return Err(VmsError::corruption(
                format!("{} directory index", self.fs.name),
                format!("deeper than {MAX_INDEX_DEPTH} levels in record {}", self.dir),
            ));
        }
        for entry in entries {
            if let Some(vcn) = entry.subnode_vcn {
                let child = self.node(vcn)?;
                self.walk(&child, depth + 1, out)?;
            }
            if entry.key.is_some() {
                out.push(entry.clone());
            }
        }
        Ok(())
    }

    fn node(&self, vcn: u64) -> Result<Arc<Vec<IndexEntry>>> {
        let key = (self.dir, vcn);
        if let Some(hit) = self.fs.index_records.lock().get_cloned(&key) {
            return Ok(hit);
        }
        let Some(allocation) = &self.allocation else {
            return Err(VmsError::corruption(
                format!("{} directory index", self.fs.name),
                format!("record {} has subnodes but no $INDEX_ALLOCATION", self.dir),
            ));
        };
        let unit = if self.record_size >= self.fs.cluster_size {
            self.fs.cluster_size
        } else {
            SMALL_INDEX_VCN_UNIT
        };
        let offset = vcn.checked_mul(unit).ok_or_else(|| {
            VmsError::corruption(format!("{} directory index", self.fs.name), "VCN overflow")
        })?;
        if offset + self.record_size > allocation.size {
            return Err(VmsError::corruption(
                format!("{} directory index", self.fs.name),
                format!("VCN {vcn} beyond $INDEX_ALLOCATION"),
            ));
        }
        let mut raw = vec![0_u8; self.record_size as usize];
        self.fs.read_stream(allocation, offset, &mut raw)?;
        apply_fixups(&mut raw).map_err(|e| self.fs.parse_err("index record", &e))?;
        let entries =
            Arc::new(parse_index_record(&raw).map_err(|e| self.fs.parse_err("index record", &e))?);
        self.fs.index_records.lock().insert(key, Arc::clone(&entries));
        Ok(entries)
    }
}

impl Namespace for NtfsInner {
    type Node = Arc<NtfsNode>;

    fn root(&self) -> Result<Arc<NtfsNode>> {
        self.load(MFT_RECORD_ROOT)
    }

    fn lookup(&self, dir: &Arc<NtfsNode>, name: &str) -> Result<Option<Arc<NtfsNode>>> {
        let wanted = name.to_uppercase();
        let found = self
            .index_entries(dir)?
            .into_iter()
            .find(|entry| {
                entry
                    .key
                    .as_ref()
                    .is_some_and(|key| key.name.to_uppercase() == wanted)
            });
        let Some(entry) = found else {
            return Ok(None);
        };
        match self.load(file_ref_record(entry.file_ref)) {
            Ok(node) => Ok(Some(node)),
            Err(VmsError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn is_dir(&self, node: &Arc<NtfsNode>) -> Result<bool> {
        Ok(node.header.is_directory())
    }

    /// Drive-qualified targets (`C:/...`) are taken as absolute paths on
    /// this volume.
    fn symlink_target(&self, node: &Arc<NtfsNode>) -> Result<Option<String>> {
        if !node.has_reparse_point() {
            return Ok(None);
        }
        Ok(self.link_target(node)?.map(|target| strip_drive(&target)))
    }
}

fn strip_drive(target: &str) -> String {
    let bytes = target.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = &target[2..];
        if rest.starts_with('/') {
            rest.to_owned()
        } else {
            format!("/{rest}")
        }
    } else {
        target.to_owned()
    }
}

#[derive(Debug)]
struct NtfsFileData {
    fs: Arc<NtfsInner>,
    stream: Stream,
}

impl FileData for NtfsFileData {
    fn len(&self) -> u64 {
        self.stream.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.fs.read_stream(&self.stream, offset, buf)
    }
}

impl FileSystem for NtfsFs {
    fn fs_type(&self) -> &'static str {
        "ntfs"
    }

    fn volume_name(&self) -> Option<String> {
        self.inner.volume_name.clone()
    }

    fn fs_id(&self) -> String {
        self.inner.boot.serial_string()
    }

    fn free_bytes(&self) -> Result<u64> {
        self.inner.free_bytes()
    }

    fn pwd(&self) -> String {
        self.cwd.lock().clone()
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path, true)?;
        if !resolved.node.header.is_directory() {
            return Err(VmsError::NotDirectory(resolved.path));
        }
        *self.cwd.lock() = resolved.path;
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        self.inner.stat(&self.resolve(path, false)?.node)
    }

    fn stat_follow(&self, path: &str) -> Result<FileStat> {
        self.inner.stat(&self.resolve(path, true)?.node)
    }

    fn dir_entries(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve(path, true)?;
        if !resolved.node.header.is_directory() {
            return Err(VmsError::NotDirectory(resolved.path));
        }
        Ok(self
            .inner
            .list_dir(&resolved.node)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    fn read_link(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path, false)?;
        self.inner
            .link_target(&resolved.node)?
            .ok_or(VmsError::NotSymlink(resolved.path))
    }

    fn open(&self, path: &str) -> Result<FsFile> {
        let resolved = self.resolve(path, true)?;
        if resolved.node.header.is_directory() {
            return Err(VmsError::IsDirectory(resolved.path));
        }
        let stream = match resolved.node.attr(AT_DATA, "") {
            Some(attr) => Stream::from_attribute(attr, &resolved.path)?,
            None => Stream {
                size: 0,
                initialized: 0,
                body: StreamBody::Resident(Arc::new(Vec::new())),
            },
        };
        debug!(volume = %self.inner.name, path = %resolved.path, size = stream.size, "open");
        Ok(FsFile::new(Box::new(NtfsFileData {
            fs: Arc::clone(&self.inner),
            stream,
        })))
    }
}
