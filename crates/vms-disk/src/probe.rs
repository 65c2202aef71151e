//! Format probe chain.
//!
//! Each [`DiskFormat`] offers a cheap signature check and a constructor that
//! wraps the lower backend. [`FormatRegistry::stack`] runs the probes in
//! registration order, wraps the first match, and probes again on top of the
//! new layer until nothing matches. No match at all means a flat disk.

use crate::vhd::VhdFormat;
use crate::vhdx::VhdxFormat;
use crate::vmdk::VmdkSparseFormat;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vms_block::{AccessMode, DiskBackend};
use vms_error::Result;

/// Bound on stacked format layers.
pub const MAX_FORMAT_LAYERS: usize = 8;

/// State threaded through the layers being stacked.
#[derive(Debug)]
pub struct FormatContext {
    pub mode: AccessMode,
    /// Copy-on-write parent, consumed by the first layer that uses one.
    pub parent: Option<Arc<dyn DiskBackend>>,
    /// Name of the disk being opened, for logs and errors.
    pub disk_name: String,
}

impl FormatContext {
    #[must_use]
    pub fn new(disk_name: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            mode,
            parent: None,
            disk_name: disk_name.into(),
        }
    }
}

/// A virtual disk format that can sit on top of another backend.
pub trait DiskFormat: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Signature check. `Ok(false)` is a mismatch; errors are reserved for
    /// transport failures that prevent probing at all.
    fn probe(&self, dev: &dyn DiskBackend) -> Result<bool>;

    /// Wrap `lower`. Structural problems found here are errors: the format
    /// has been committed to.
    fn open(
        &self,
        lower: Arc<dyn DiskBackend>,
        ctx: &mut FormatContext,
    ) -> Result<Arc<dyn DiskBackend>>;
}

/// Ordered set of formats; first match wins.
#[derive(Debug)]
pub struct FormatRegistry {
    formats: Vec<Box<dyn DiskFormat>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::empty()
            .with(VmdkSparseFormat)
            .with(VhdxFormat)
            .with(VhdFormat)
    }
}

impl FormatRegistry {
    /// Registry with no formats: everything opens as flat.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// Append `format` at the lowest priority.
    #[must_use]
    pub fn with(mut self, format: impl DiskFormat + 'static) -> Self {
        self.register(format);
        self
    }

    pub fn register(&mut self, format: impl DiskFormat + 'static) {
        self.formats.push(Box::new(format));
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.formats.iter().map(|f| f.name()).collect()
    }

    /// First format whose signature matches `dev`.
    pub fn detect(&self, dev: &dyn DiskBackend) -> Result<Option<&dyn DiskFormat>> {
        for format in &self.formats {
            if format.probe(dev)? {
                debug!(format = format.name(), "format probe matched");
                return Ok(Some(format.as_ref()));
            }
            trace!(format = format.name(), "format probe did not match");
        }
        Ok(None)
    }

    /// Wrap `base` in every detected format layer.
    pub fn stack(
        &self,
        base: Arc<dyn DiskBackend>,
        ctx: &mut FormatContext,
    ) -> Result<Arc<dyn DiskBackend>> {
        let mut current = base;
        for depth in 0..MAX_FORMAT_LAYERS {
            let Some(format) = self.detect(current.as_ref())? else {
                trace!(disk = %ctx.disk_name, depth, "no further format layer");
                return Ok(current);
            };
            debug!(disk = %ctx.disk_name, format = format.name(), depth, "stacking format layer");
            current = match format.open(Arc::clone(&current), ctx) {
                Ok(layer) => layer,
                Err(err) => {
                    let _ = current.close();
                    return Err(err);
                }
            };
        }
        warn!(disk = %ctx.disk_name, "format stacking stopped at {MAX_FORMAT_LAYERS} layers");
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    /// Toy format: a 4-byte "WRAP" header in front of the payload.
    #[derive(Debug)]
    struct Wrapped;

    impl DiskFormat for Wrapped {
        fn name(&self) -> &'static str {
            "wrapped"
        }

        fn probe(&self, dev: &dyn DiskBackend) -> Result<bool> {
            let mut magic = [0_u8; 4];
            if vms_block::read_clamped(dev, 0, &mut magic)? < 4 {
                return Ok(false);
            }
            Ok(&magic == b"WRAP")
        }

        fn open(
            &self,
            lower: Arc<dyn DiskBackend>,
            _ctx: &mut FormatContext,
        ) -> Result<Arc<dyn DiskBackend>> {
            let len = lower.len_bytes() - 4;
            Ok(Arc::new(vms_block::WindowBackend::new(lower, 4, len)?))
        }
    }

    #[test]
    fn unknown_content_stays_flat() {
        let registry = FormatRegistry::default();
        let base: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::zeroed(4096));
        let mut ctx = FormatContext::new("disk0", AccessMode::ReadOnly);
        let stacked = registry.stack(Arc::clone(&base), &mut ctx).expect("stack");
        assert_eq!(stacked.kind(), "memory");
    }

    #[test]
    fn layers_are_stacked_until_no_probe_matches() {
        let registry = FormatRegistry::empty().with(Wrapped);
        let mut bytes = b"WRAPWRAP".to_vec();
        bytes.extend_from_slice(b"payload");
        let base: Arc<dyn DiskBackend> = Arc::new(MemoryBackend::new(bytes));
        let mut ctx = FormatContext::new("disk0", AccessMode::ReadOnly);
        let stacked = registry.stack(base, &mut ctx).expect("stack");
        let mut buf = vec![0_u8; 7];
        stacked.read_exact_at(0, &mut buf).expect("read");
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn first_registered_probe_wins() {
        let registry = FormatRegistry::empty().with(Wrapped).with(Wrapped);
        let dev = MemoryBackend::new(b"WRAPxxxx".to_vec());
        let hit = registry.detect(&dev).expect("detect").expect("match");
        assert_eq!(hit.name(), "wrapped");
        assert_eq!(FormatRegistry::default().names(), vec!["vmdk-sparse", "vhdx", "vhd"]);
    }
}
