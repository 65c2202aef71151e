//! Volume group model built from parsed LVM2 text metadata.

use serde::Serialize;
use vms_error::{Result, VmsError};

use crate::config::{ConfigSection, ConfigValue};

/// Upper bound on segments per logical volume.
const MAX_SEGMENTS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeGroup {
    pub name: String,
    pub id: String,
    pub seqno: u64,
    /// Extent size in sectors.
    pub extent_size: u64,
    pub physical_volumes: Vec<PvMeta>,
    pub logical_volumes: Vec<LvMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PvMeta {
    /// Name local to the metadata (`pv0`), referenced by stripes.
    pub name: String,
    pub id: String,
    pub device_hint: Option<String>,
    /// First physical extent, in sectors from the start of the PV.
    pub pe_start: u64,
    pub pe_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LvMeta {
    pub name: String,
    pub id: String,
    pub status: Vec<String>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub start_extent: u64,
    pub extent_count: u64,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stripe {
    /// PV name, or the name of another LV in the same group.
    pub target: String,
    pub start_extent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentKind {
    Striped {
        /// Chunk size in sectors; only meaningful with more than one stripe.
        stripe_size: u64,
        stripes: Vec<Stripe>,
    },
    ThinPool {
        metadata: String,
        data: String,
        /// Data block size in sectors.
        chunk_size: u64,
        transaction_id: u64,
    },
    Thin {
        pool: String,
        device_id: u64,
    },
    Zero,
    Error,
    /// Recognised segment type that is not mapped (mirror, raid, cache...).
    Other(String),
}

impl SegmentKind {
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Striped { .. } => "striped",
            Self::ThinPool { .. } => "thin-pool",
            Self::Thin { .. } => "thin",
            Self::Zero => "zero",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }
}

impl LvMeta {
    /// Extents covered by the address space, gaps included.
    #[must_use]
    pub fn extent_span(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.start_extent.saturating_add(s.extent_count))
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_thin_pool(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s.kind, SegmentKind::ThinPool { .. }))
    }

    /// Visible volumes carry the `VISIBLE` flag and are not pool internals.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        let internal = ["_tmeta", "_tdata", "_pmspare"]
            .iter()
            .any(|suffix| self.name.ends_with(suffix));
        self.status.iter().any(|s| s == "VISIBLE") && !internal && !self.is_thin_pool()
    }
}

impl VolumeGroup {
    /// Find the volume group section in a parsed metadata root and decode it.
    pub fn from_config(root: &ConfigSection) -> Result<Self> {
        let (name, section) = root
            .sections()
            .find(|(_, s)| s.get("seqno").is_some() && s.get("id").is_some())
            .ok_or_else(|| VmsError::corruption("LVM metadata", "no volume group section"))?;
        let context = format!("volume group {name}");
        let extent_size = section.require_u64("extent_size", &context)?;
        if extent_size == 0 {
            return Err(VmsError::corruption(&context, "extent_size is zero"));
        }

        let mut physical_volumes = Vec::new();
        if let Some(pvs) = section.section("physical_volumes") {
            for (pv_name, pv) in pvs.sections() {
                let pv_context = format!("{context} pv {pv_name}");
                physical_volumes.push(PvMeta {
                    name: pv_name.to_owned(),
                    id: pv.require_str("id", &pv_context)?.to_owned(),
                    device_hint: pv.str("device").map(str::to_owned),
                    pe_start: pv.require_u64("pe_start", &pv_context)?,
                    pe_count: pv.require_u64("pe_count", &pv_context)?,
                });
            }
        }

        let mut logical_volumes = Vec::new();
        if let Some(lvs) = section.section("logical_volumes") {
            for (lv_name, lv) in lvs.sections() {
                logical_volumes.push(parse_lv(&context, lv_name, lv)?);
            }
        }

        Ok(Self {
            name: name.to_owned(),
            id: section.require_str("id", &context)?.to_owned(),
            seqno: section.require_u64("seqno", &context)?,
            extent_size,
            physical_volumes,
            logical_volumes,
        })
    }

    /// Extent size in bytes.
    #[must_use]
    pub fn extent_bytes(&self) -> u64 {
        self.extent_size * 512
    }

    #[must_use]
    pub fn pv(&self, name: &str) -> Option<&PvMeta> {
        self.physical_volumes.iter().find(|pv| pv.name == name)
    }

    #[must_use]
    pub fn lv(&self, name: &str) -> Option<&LvMeta> {
        self.logical_volumes.iter().find(|lv| lv.name == name)
    }
}

fn parse_lv(vg_context: &str, name: &str, lv: &ConfigSection) -> Result<LvMeta> {
    let context = format!("{vg_context} lv {name}");
    let mut segments = Vec::new();
    for (key, seg) in lv.sections() {
        if !key.starts_with("segment") {
            continue;
        }
        if segments.len() == MAX_SEGMENTS {
            return Err(VmsError::corruption(&context, "too many segments"));
        }
        segments.push(parse_segment(&format!("{context} {key}"), seg)?);
    }
    segments.sort_by_key(|s: &Segment| s.start_extent);
    for pair in segments.windows(2) {
        if pair[0].start_extent.saturating_add(pair[0].extent_count) > pair[1].start_extent {
            return Err(VmsError::corruption(
                &context,
                format!("segments overlap at extent {}", pair[1].start_extent),
            ));
        }
    }
    Ok(LvMeta {
        name: name.to_owned(),
        id: lv.require_str("id", &context)?.to_owned(),
        status: lv.str_list("status").into_iter().map(str::to_owned).collect(),
        segments,
    })
}

fn parse_segment(context: &str, seg: &ConfigSection) -> Result<Segment> {
    let start_extent = seg.require_u64("start_extent", context)?;
    let extent_count = seg.require_u64("extent_count", context)?;
    let kind = match seg.require_str("type", context)? {
        "striped" => {
            let stripe_count = seg.require_u64("stripe_count", context)?;
            let stripes = parse_stripes(context, seg)?;
            if stripes.is_empty() || stripes.len() as u64 != stripe_count {
                return Err(VmsError::corruption(
                    context,
                    format!("stripe_count {stripe_count} but {} stripes listed", stripes.len()),
                ));
            }
            if extent_count % stripe_count != 0 {
                return Err(VmsError::corruption(
                    context,
                    "extent_count is not a multiple of stripe_count",
                ));
            }
            let stripe_size = if stripe_count > 1 {
                let size = seg.require_u64("stripe_size", context)?;
                if size == 0 {
                    return Err(VmsError::corruption(context, "stripe_size is zero"));
                }
                size
            } else {
                seg.int("stripe_size").and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
            };
            SegmentKind::Striped {
                stripe_size,
                stripes,
            }
        }
        "thin-pool" => SegmentKind::ThinPool {
            metadata: seg.require_str("metadata", context)?.to_owned(),
            data: seg.require_str("pool", context)?.to_owned(),
            chunk_size: seg.require_u64("chunk_size", context)?,
            transaction_id: seg.int("transaction_id").and_then(|v| u64::try_from(v).ok()).unwrap_or(0),
        },
        "thin" => SegmentKind::Thin {
            pool: seg.require_str("thin_pool", context)?.to_owned(),
            device_id: seg.require_u64("device_id", context)?,
        },
        "zero" => SegmentKind::Zero,
        "error" => SegmentKind::Error,
        other => SegmentKind::Other(other.to_owned()),
    };
    Ok(Segment {
        start_extent,
        extent_count,
        kind,
    })
}

/// `stripes = ["pv0", 0, "pv1", 0]`: target name, start extent pairs.
fn parse_stripes(context: &str, seg: &ConfigSection) -> Result<Vec<Stripe>> {
    let items = seg
        .get("stripes")
        .and_then(ConfigValue::as_array)
        .ok_or_else(|| VmsError::corruption(context, "missing `stripes` array"))?;
    if items.len() % 2 != 0 {
        return Err(VmsError::corruption(context, "`stripes` has an odd number of items"));
    }
    items
        .chunks(2)
        .map(|pair| {
            let target = pair[0]
                .as_str()
                .ok_or_else(|| VmsError::corruption(context, "stripe target is not a string"))?;
            let start = pair[1]
                .as_int()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| VmsError::corruption(context, "stripe start is not an extent"))?;
            Ok(Stripe {
                target: target.to_owned(),
                start_extent: start,
            })
        })
        .collect()
}
