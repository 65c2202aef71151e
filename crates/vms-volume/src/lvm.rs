//! Logical volumes as byte-addressable backends.
//!
//! A logical volume is an ordered list of segments. Each segment maps a
//! contiguous range of the volume onto a target: stripes on physical (or
//! other logical) volumes, a thin device in a pool, zeros, or an error
//! target. Ranges between segments are holes and fail with
//! `UnmappedExtent`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;
use vms_block::{DiskBackend, check_range};
use vms_error::{Result, VmsError};

use crate::thin::ThinPool;

/// Where one stripe of a segment lives.
#[derive(Debug, Clone)]
pub struct StripeTarget {
    pub dev: Arc<dyn DiskBackend>,
    /// Byte offset of the stripe's first extent on `dev`.
    pub start: u64,
}

#[derive(Debug, Clone)]
pub enum SegmentTarget {
    Striped {
        /// Chunk size in bytes; unused with a single stripe.
        stripe_bytes: u64,
        stripes: Vec<StripeTarget>,
    },
    Thin {
        pool: Arc<ThinPool>,
        device_id: u64,
    },
    /// A pool read directly addresses its data volume.
    PoolData(Arc<dyn DiskBackend>),
    Zero,
    Error,
    Unsupported(String),
}

impl SegmentTarget {
    fn is_writable(&self) -> bool {
        match self {
            Self::Striped { stripes, .. } => stripes.iter().all(|s| s.dev.is_writable()),
            Self::Thin { pool, .. } => pool.data().is_writable(),
            Self::PoolData(dev) => dev.is_writable(),
            Self::Zero | Self::Error | Self::Unsupported(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappedSegment {
    /// Byte range of the segment inside the volume.
    pub start: u64,
    pub len: u64,
    pub target: SegmentTarget,
}

impl MappedSegment {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

#[derive(Debug)]
pub struct LogicalVolume {
    vg_name: String,
    name: String,
    uuid: String,
    len: u64,
    segments: Vec<MappedSegment>,
    closed: AtomicBool,
}

impl LogicalVolume {
    /// `segments` must be sorted and non-overlapping; `len` may extend past
    /// the last segment when trailing extents are unmapped.
    pub fn new(
        vg_name: impl Into<String>,
        name: impl Into<String>,
        uuid: impl Into<String>,
        len: u64,
        segments: Vec<MappedSegment>,
    ) -> Result<Self> {
        let name = name.into();
        let mut prev_end = 0_u64;
        for seg in &segments {
            let end = seg.start.checked_add(seg.len).filter(|&e| e <= len);
            match end {
                Some(end) if seg.start >= prev_end => prev_end = end,
                _ => {
                    return Err(VmsError::corruption(
                        format!("logical volume {name}"),
                        format!("segment at byte {} is out of order or out of range", seg.start),
                    ));
                }
            }
        }
        Ok(Self {
            vg_name: vg_name.into(),
            name,
            uuid: uuid.into(),
            len,
            segments,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn vg_name(&self) -> &str {
        &self.vg_name
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// `vg/lv`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.vg_name, self.name)
    }

    #[must_use]
    pub fn segments(&self) -> &[MappedSegment] {
        &self.segments
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VmsError::Closed(self.full_name()));
        }
        Ok(())
    }

    fn segment_at(&self, pos: u64) -> Option<&MappedSegment> {
        let idx = self.segments.partition_point(|s| s.end() <= pos);
        self.segments.get(idx).filter(|s| s.start <= pos)
    }

    /// Bytes from `pos` up to the next mapped segment (or the volume end).
    fn hole_len(&self, pos: u64) -> u64 {
        let next = self.segments.partition_point(|s| s.end() <= pos);
        self.segments
            .get(next)
            .map_or(self.len, |s| s.start)
            .saturating_sub(pos)
    }

    /// Apply `op` to each `(segment, offset in segment, buffer range)` piece
    /// of `[offset, offset + len)`.
    fn for_each_piece(
        &self,
        offset: u64,
        len: usize,
        mut op: impl FnMut(&MappedSegment, u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0_usize;
        while done < len {
            let pos = offset + done as u64;
            let Some(seg) = self.segment_at(pos) else {
                return Err(VmsError::UnmappedExtent {
                    volume: self.full_name(),
                    offset: pos,
                    len: self.hole_len(pos).min((len - done) as u64),
                });
            };
            let n = (seg.end() - pos).min((len - done) as u64) as usize;
            op(seg, pos - seg.start, done..done + n)?;
            done += n;
        }
        Ok(())
    }
}

/// Split `[seg_off, seg_off + len)` of a striped segment into
/// `(stripe index, byte offset on that stripe's device, len)` pieces.
pub(crate) fn stripe_pieces(
    stripes: &[StripeTarget],
    stripe_bytes: u64,
    seg_off: u64,
    len: u64,
) -> Vec<(usize, u64, u64)> {
    if stripes.len() == 1 {
        return vec![(0, stripes[0].start + seg_off, len)];
    }
    let n = stripes.len() as u64;
    let mut pieces = Vec::new();
    let mut done = 0_u64;
    while done < len {
        let at = seg_off + done;
        let chunk = at / stripe_bytes;
        let within = at % stripe_bytes;
        let stripe = (chunk % n) as usize;
        let row = chunk / n;
        let piece = (stripe_bytes - within).min(len - done);
        pieces.push((stripe, stripes[stripe].start + row * stripe_bytes + within, piece));
        done += piece;
    }
    pieces
}

impl DiskBackend for LogicalVolume {
    fn kind(&self) -> &'static str {
        "lvm-lv"
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        check_range("logical volume", offset, buf.len(), self.len)?;
        self.for_each_piece(offset, buf.len(), |seg, seg_off, range| {
            let chunk = &mut buf[range];
            trace!(lv = %self.name, seg_start = seg.start, seg_off, len = chunk.len(), "lv read");
            match &seg.target {
                SegmentTarget::Striped {
                    stripe_bytes,
                    stripes,
                } => {
                    let mut at = 0_usize;
                    for (stripe, dev_off, n) in
                        stripe_pieces(stripes, *stripe_bytes, seg_off, chunk.len() as u64)
                    {
                        let n = n as usize;
                        stripes[stripe]
                            .dev
                            .read_exact_at(dev_off, &mut chunk[at..at + n])?;
                        at += n;
                    }
                    Ok(())
                }
                SegmentTarget::Thin { pool, device_id } => {
                    pool.read_device(*device_id, seg.start + seg_off, chunk)
                }
                SegmentTarget::PoolData(dev) => dev.read_exact_at(seg_off, chunk),
                SegmentTarget::Zero => {
                    chunk.fill(0);
                    Ok(())
                }
                SegmentTarget::Error => Err(VmsError::Io(std::io::Error::other(format!(
                    "error target in {} at byte {}",
                    self.full_name(),
                    seg.start + seg_off
                )))),
                SegmentTarget::Unsupported(kind) => Err(VmsError::UnsupportedFeature(format!(
                    "{kind} segment in {}",
                    self.full_name()
                ))),
            }
        })
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        check_range("logical volume", offset, buf.len(), self.len)?;
        self.for_each_piece(offset, buf.len(), |seg, seg_off, range| {
            let chunk = &buf[range];
            match &seg.target {
                SegmentTarget::Striped {
                    stripe_bytes,
                    stripes,
                } => {
                    let mut at = 0_usize;
                    for (stripe, dev_off, n) in
                        stripe_pieces(stripes, *stripe_bytes, seg_off, chunk.len() as u64)
                    {
                        let n = n as usize;
                        stripes[stripe].dev.write_all_at(dev_off, &chunk[at..at + n])?;
                        at += n;
                    }
                    Ok(())
                }
                SegmentTarget::Thin { pool, device_id } => {
                    pool.write_device(*device_id, seg.start + seg_off, chunk)
                }
                SegmentTarget::PoolData(dev) => dev.write_all_at(seg_off, chunk),
                SegmentTarget::Zero | SegmentTarget::Error => Err(VmsError::unsupported_op(
                    "write",
                    format!("{} segment of {}", kind_name(&seg.target), self.full_name()),
                )),
                SegmentTarget::Unsupported(kind) => Err(VmsError::UnsupportedFeature(format!(
                    "{kind} segment in {}",
                    self.full_name()
                ))),
            }
        })
    }

    fn is_writable(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.target.is_writable())
    }

    /// Physical volumes are shared between logical volumes and are closed
    /// by the volume manager, not here.
    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            for seg in &self.segments {
                if let SegmentTarget::Thin { pool, .. } = &seg.target {
                    pool.release();
                }
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn kind_name(target: &SegmentTarget) -> &'static str {
    match target {
        SegmentTarget::Striped { .. } => "striped",
        SegmentTarget::Thin { .. } => "thin",
        SegmentTarget::PoolData(_) => "thin-pool",
        SegmentTarget::Zero => "zero",
        SegmentTarget::Error => "error",
        SegmentTarget::Unsupported(_) => "unsupported",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    fn filled(len: usize, byte: u8) -> Arc<dyn DiskBackend> {
        Arc::new(MemoryBackend::new(vec![byte; len]))
    }

    fn striped(start: u64, len: u64, stripes: Vec<StripeTarget>, stripe_bytes: u64) -> MappedSegment {
        MappedSegment {
            start,
            len,
            target: SegmentTarget::Striped {
                stripe_bytes,
                stripes,
            },
        }
    }

    #[test]
    fn round_robin_stripes_alternate_devices() {
        let a = StripeTarget {
            dev: filled(4096, 0xAA),
            start: 0,
        };
        let b = StripeTarget {
            dev: filled(4096, 0xBB),
            start: 1024,
        };
        let pieces = stripe_pieces(&[a.clone(), b.clone()], 512, 256, 1536);
        assert_eq!(
            pieces,
            vec![(0, 256, 256), (1, 1024, 512), (0, 512, 512), (1, 1536, 256)]
        );

        let lv = LogicalVolume::new("vg", "lv", "id", 2048, vec![striped(0, 2048, vec![a, b], 512)])
            .expect("lv");
        let mut buf = vec![0_u8; 1024];
        lv.read_exact_at(256, &mut buf).expect("read");
        assert!(buf[..256].iter().all(|&x| x == 0xAA));
        assert!(buf[256..768].iter().all(|&x| x == 0xBB));
        assert!(buf[768..].iter().all(|&x| x == 0xAA));
    }

    #[test]
    fn gaps_are_unmapped_extents() {
        let lv = LogicalVolume::new(
            "vg",
            "lv",
            "id",
            4096,
            vec![
                striped(0, 1024, vec![StripeTarget { dev: filled(4096, 1), start: 0 }], 0),
                striped(3072, 1024, vec![StripeTarget { dev: filled(4096, 2), start: 0 }], 0),
            ],
        )
        .expect("lv");
        let mut buf = vec![0_u8; 2048];
        let err = lv.read_exact_at(512, &mut buf).expect_err("hole");
        match err {
            VmsError::UnmappedExtent { volume, offset, len } => {
                assert_eq!(volume, "vg/lv");
                assert_eq!(offset, 1024);
                assert_eq!(len, 1536);
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut tail = vec![0_u8; 512];
        lv.read_exact_at(3584, &mut tail).expect("mapped tail");
        assert!(tail.iter().all(|&x| x == 2));
    }

    #[test]
    fn zero_error_and_unsupported_targets() {
        let lv = LogicalVolume::new(
            "vg",
            "lv",
            "id",
            3072,
            vec![
                MappedSegment { start: 0, len: 1024, target: SegmentTarget::Zero },
                MappedSegment { start: 1024, len: 1024, target: SegmentTarget::Error },
                MappedSegment {
                    start: 2048,
                    len: 1024,
                    target: SegmentTarget::Unsupported("raid1".into()),
                },
            ],
        )
        .expect("lv");
        let mut buf = vec![7_u8; 1024];
        lv.read_exact_at(0, &mut buf).expect("zero");
        assert!(buf.iter().all(|&x| x == 0));
        assert!(matches!(lv.read_exact_at(1024, &mut buf), Err(VmsError::Io(_))));
        assert!(matches!(
            lv.read_exact_at(2048, &mut buf),
            Err(VmsError::UnsupportedFeature(_))
        ));
        assert!(!lv.is_writable());
    }

    #[test]
    fn closed_volume_refuses_reads() {
        let lv = LogicalVolume::new(
            "vg",
            "lv",
            "id",
            512,
            vec![MappedSegment { start: 0, len: 512, target: SegmentTarget::Zero }],
        )
        .expect("lv");
        lv.close().expect("close");
        lv.close().expect("close twice");
        let mut buf = [0_u8; 16];
        assert!(matches!(lv.read_exact_at(0, &mut buf), Err(VmsError::Closed(_))));
    }

    #[test]
    fn segments_past_the_end_are_rejected() {
        let err = LogicalVolume::new(
            "vg",
            "lv",
            "id",
            512,
            vec![MappedSegment { start: 0, len: 1024, target: SegmentTarget::Zero }],
        )
        .expect_err("out of range");
        assert_eq!(err.class(), vms_error::ErrorClass::CorruptStructure);
    }
}
