//! LVM2 volume manager: groups labelled physical volumes into volume
//! groups and exposes their logical volumes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};
use vms_block::DiskBackend;
use vms_error::{Result, VmsError};

use crate::config;
use crate::label::{PvLabel, read_label, read_metadata_text};
use crate::lvm::{LogicalVolume, MappedSegment, SegmentTarget, StripeTarget};
use crate::metadata::{LvMeta, SegmentKind, VolumeGroup};
use crate::thin::ThinPool;
use crate::{PhysicalVolume, Volume, VolumeKind, VolumeManager};

/// Logical volumes may stack (thin → pool → tmeta/tdata, stripes on LVs).
const MAX_LV_NESTING: usize = 8;

#[derive(Debug)]
pub struct LvmVolumeManager {
    physical: Vec<PhysicalVolume>,
    labels: Vec<Option<PvLabel>>,
    groups: Vec<VolumeGroup>,
    /// Every logical volume that was built, keyed by `vg/lv`.
    logical: BTreeMap<String, Arc<LogicalVolume>>,
    visible: Vec<Volume>,
    lv_errors: Vec<(String, String)>,
    closed: AtomicBool,
}

impl LvmVolumeManager {
    /// Scan `physical` for LVM2 labels and assemble every volume group found.
    ///
    /// Damaged labels, metadata and logical volumes are logged and skipped.
    pub fn new(physical: Vec<PhysicalVolume>) -> Result<Self> {
        let mut labels = Vec::with_capacity(physical.len());
        let mut candidates: BTreeMap<String, VolumeGroup> = BTreeMap::new();
        for pv in &physical {
            let label = match read_label(pv.backend.as_ref()) {
                Ok(label) => label,
                Err(err) => {
                    warn!(pv = %pv.name, error = %err, "unreadable LVM label, treating as plain volume");
                    None
                }
            };
            if let Some(label) = &label {
                debug!(pv = %pv.name, uuid = %label.pv_uuid, "LVM physical volume");
                for vg in read_groups(pv, label) {
                    match candidates.get(&vg.id) {
                        Some(known) if known.seqno >= vg.seqno => {}
                        _ => {
                            candidates.insert(vg.id.clone(), vg);
                        }
                    }
                }
            }
            labels.push(label);
        }

        let mut manager = Self {
            physical,
            labels,
            groups: candidates.into_values().collect(),
            logical: BTreeMap::new(),
            visible: Vec::new(),
            lv_errors: Vec::new(),
            closed: AtomicBool::new(false),
        };
        manager.assemble();
        Ok(manager)
    }

    fn assemble(&mut self) {
        for (pv, label) in self.physical.iter().zip(&self.labels) {
            if label.is_none() {
                self.visible.push(Volume {
                    name: pv.name.clone(),
                    backend: Arc::clone(&pv.backend),
                    kind: VolumeKind::Physical {
                        hardware_id: pv.hardware_id.clone(),
                        partition: pv.partition,
                    },
                });
            }
        }

        for vg in &self.groups {
            let devices = self.pv_devices(vg);
            let mut builder = GroupBuilder {
                vg,
                devices,
                built: HashMap::new(),
                pools: HashMap::new(),
            };
            for lv in &vg.logical_volumes {
                match builder.lv(&lv.name, 0) {
                    Ok(volume) => {
                        if lv.is_visible() {
                            self.visible.push(Volume {
                                name: volume.full_name(),
                                backend: Arc::clone(&volume) as Arc<dyn DiskBackend>,
                                kind: VolumeKind::Logical {
                                    vg_name: vg.name.clone(),
                                    lv_name: lv.name.clone(),
                                    lv_uuid: Some(lv.id.clone()),
                                },
                            });
                        }
                    }
                    Err(err) => {
                        warn!(vg = %vg.name, lv = %lv.name, error = %err, "skipping logical volume");
                        self.lv_errors.push((format!("{}/{}", vg.name, lv.name), err.to_string()));
                    }
                }
            }
            for (name, volume) in builder.built {
                self.logical.insert(format!("{}/{name}", vg.name), volume);
            }
            info!(
                vg = %vg.name,
                seqno = vg.seqno,
                pvs = vg.physical_volumes.len(),
                lvs = vg.logical_volumes.len(),
                "volume group assembled"
            );
        }
    }

    /// Metadata PV name → backend, for PVs present in this session.
    fn pv_devices(&self, vg: &VolumeGroup) -> HashMap<String, Arc<dyn DiskBackend>> {
        let mut out = HashMap::new();
        for meta in &vg.physical_volumes {
            let found = self
                .physical
                .iter()
                .zip(&self.labels)
                .find(|(_, label)| label.as_ref().is_some_and(|l| l.pv_uuid == meta.id));
            match found {
                Some((pv, _)) => {
                    out.insert(meta.name.clone(), Arc::clone(&pv.backend));
                }
                None => warn!(vg = %vg.name, pv = %meta.name, uuid = %meta.id, "physical volume missing"),
            }
        }
        out
    }

    #[must_use]
    pub fn volume_groups(&self) -> &[VolumeGroup] {
        &self.groups
    }

    /// Built logical volume by `vg/lv`, hidden ones included.
    #[must_use]
    pub fn logical_volume(&self, full_name: &str) -> Option<&Arc<LogicalVolume>> {
        self.logical.get(full_name)
    }

    /// Logical volumes that could not be mapped, with the reason.
    #[must_use]
    pub fn lv_errors(&self) -> &[(String, String)] {
        &self.lv_errors
    }
}

/// Every volume group described by the metadata areas of one PV.
fn read_groups(pv: &PhysicalVolume, label: &PvLabel) -> Vec<VolumeGroup> {
    let mut groups = Vec::new();
    for area in &label.metadata_areas {
        let parsed = read_metadata_text(pv.backend.as_ref(), *area).and_then(|text| {
            text.map(|t| config::parse(&t).and_then(|root| VolumeGroup::from_config(&root)))
                .transpose()
        });
        match parsed {
            Ok(Some(vg)) => groups.push(vg),
            Ok(None) => debug!(pv = %pv.name, area = area.offset, "metadata area is empty"),
            Err(err) => warn!(pv = %pv.name, area = area.offset, error = %err, "unusable LVM metadata"),
        }
    }
    groups
}

struct GroupBuilder<'a> {
    vg: &'a VolumeGroup,
    devices: HashMap<String, Arc<dyn DiskBackend>>,
    built: HashMap<String, Arc<LogicalVolume>>,
    pools: HashMap<String, Arc<ThinPool>>,
}

impl<'a> GroupBuilder<'a> {
    fn lv(&mut self, name: &str, depth: usize) -> Result<Arc<LogicalVolume>> {
        if let Some(lv) = self.built.get(name) {
            return Ok(Arc::clone(lv));
        }
        if depth > MAX_LV_NESTING {
            return Err(VmsError::corruption(
                format!("volume group {}", self.vg.name),
                format!("logical volume {name} nests too deeply"),
            ));
        }
        let vg: &'a VolumeGroup = self.vg;
        let meta = vg.lv(name).ok_or_else(|| {
            VmsError::corruption(
                format!("volume group {}", vg.name),
                format!("reference to unknown logical volume {name}"),
            )
        })?;
        let mut segments = Vec::with_capacity(meta.segments.len());
        for seg in &meta.segments {
            let start = self.extents_to_bytes(seg.start_extent)?;
            let len = self.extents_to_bytes(seg.extent_count)?;
            let target = self.target(meta, &seg.kind, seg.extent_count, depth)?;
            segments.push(MappedSegment { start, len, target });
        }
        let lv = Arc::new(LogicalVolume::new(
            &self.vg.name,
            &meta.name,
            &meta.id,
            self.extents_to_bytes(meta.extent_span())?,
            segments,
        )?);
        self.built.insert(name.to_owned(), Arc::clone(&lv));
        Ok(lv)
    }

    fn extents_to_bytes(&self, extents: u64) -> Result<u64> {
        extents.checked_mul(self.vg.extent_bytes()).ok_or_else(|| {
            VmsError::corruption(
                format!("volume group {}", self.vg.name),
                format!("{extents} extents overflow a byte address"),
            )
        })
    }

    fn target(
        &mut self,
        meta: &LvMeta,
        kind: &SegmentKind,
        extent_count: u64,
        depth: usize,
    ) -> Result<SegmentTarget> {
        Ok(match kind {
            SegmentKind::Striped {
                stripe_size,
                stripes,
            } => {
                let per_stripe = self.extents_to_bytes(extent_count / stripes.len() as u64)?;
                let mut targets = Vec::with_capacity(stripes.len());
                for stripe in stripes {
                    let (dev, base) = if let Some(dev) = self.devices.get(&stripe.target) {
                        let pe_start = self.vg.pv(&stripe.target).map_or(0, |pv| pv.pe_start);
                        (Arc::clone(dev), pe_start * 512)
                    } else if self.vg.pv(&stripe.target).is_some() {
                        return Err(VmsError::NotFound(format!(
                            "physical volume {} of {}/{}",
                            stripe.target, self.vg.name, meta.name
                        )));
                    } else {
                        let lv = self.lv(&stripe.target, depth + 1)?;
                        (lv as Arc<dyn DiskBackend>, 0)
                    };
                    let start = base + self.extents_to_bytes(stripe.start_extent)?;
                    if start.saturating_add(per_stripe) > dev.len_bytes() {
                        return Err(VmsError::corruption(
                            format!("logical volume {}/{}", self.vg.name, meta.name),
                            format!(
                                "stripe on {} ends at byte {} beyond its {}-byte device",
                                stripe.target,
                                start + per_stripe,
                                dev.len_bytes()
                            ),
                        ));
                    }
                    targets.push(StripeTarget { dev, start });
                }
                SegmentTarget::Striped {
                    stripe_bytes: stripe_size * 512,
                    stripes: targets,
                }
            }
            SegmentKind::Thin { pool, device_id } => SegmentTarget::Thin {
                pool: self.pool(pool, depth)?,
                device_id: *device_id,
            },
            SegmentKind::ThinPool { data, .. } => {
                SegmentTarget::PoolData(self.lv(data, depth + 1)? as Arc<dyn DiskBackend>)
            }
            SegmentKind::Zero => SegmentTarget::Zero,
            SegmentKind::Error => SegmentTarget::Error,
            SegmentKind::Other(name) => SegmentTarget::Unsupported(name.clone()),
        })
    }

    fn pool(&mut self, name: &str, depth: usize) -> Result<Arc<ThinPool>> {
        if let Some(pool) = self.pools.get(name) {
            return Ok(Arc::clone(pool));
        }
        let meta = self.vg.lv(name).ok_or_else(|| {
            VmsError::corruption(
                format!("volume group {}", self.vg.name),
                format!("thin volume refers to unknown pool {name}"),
            )
        })?;
        let (metadata, data) = meta
            .segments
            .iter()
            .find_map(|s| match &s.kind {
                SegmentKind::ThinPool { metadata, data, .. } => Some((metadata.clone(), data.clone())),
                _ => None,
            })
            .ok_or_else(|| {
                VmsError::corruption(
                    format!("volume group {}", self.vg.name),
                    format!("{name} is not a thin pool"),
                )
            })?;
        let metadata_lv = self.lv(&metadata, depth + 1)?;
        let data_lv = self.lv(&data, depth + 1)?;
        let pool = Arc::new(ThinPool::open(
            format!("{}/{name}", self.vg.name),
            metadata_lv,
            data_lv,
        )?);
        self.pools.insert(name.to_owned(), Arc::clone(&pool));
        Ok(pool)
    }
}

impl VolumeManager for LvmVolumeManager {
    fn kind(&self) -> &'static str {
        "lvm"
    }

    fn physical_volumes(&self) -> &[PhysicalVolume] {
        &self.physical
    }

    fn visible_volumes(&self) -> &[Volume] {
        &self.visible
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err = None;
        for lv in self.logical.values() {
            if let Err(err) = lv.close() {
                first_err.get_or_insert(err);
            }
        }
        for pv in &self.physical {
            if let Err(err) = pv.backend.close() {
                first_err.get_or_insert(err);
            }
        }
        debug!(lvs = self.logical.len(), pvs = self.physical.len(), "LVM volume manager closed");
        first_err.map_or(Ok(()), Err)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
