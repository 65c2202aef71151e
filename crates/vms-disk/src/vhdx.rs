//! Microsoft VHDX detection.
//!
//! VHDX images start with the 8-byte file type identifier `vhdxfile`. The
//! log-structured metadata region is not decoded; a detected image is
//! refused instead of being read as a flat disk.

use crate::probe::{DiskFormat, FormatContext};
use std::sync::Arc;
use tracing::warn;
use vms_block::{DiskBackend, read_clamped};
use vms_error::{Result, VmsError};

pub const VHDX_SIGNATURE: &[u8; 8] = b"vhdxfile";

#[derive(Debug, Clone, Copy, Default)]
pub struct VhdxFormat;

impl DiskFormat for VhdxFormat {
    fn name(&self) -> &'static str {
        "vhdx"
    }

    fn probe(&self, dev: &dyn DiskBackend) -> Result<bool> {
        let mut magic = [0_u8; 8];
        if read_clamped(dev, 0, &mut magic)? < magic.len() {
            return Ok(false);
        }
        Ok(&magic == VHDX_SIGNATURE)
    }

    fn open(
        &self,
        _lower: Arc<dyn DiskBackend>,
        ctx: &mut FormatContext,
    ) -> Result<Arc<dyn DiskBackend>> {
        warn!(disk = %ctx.disk_name, "VHDX image detected");
        Err(VmsError::UnsupportedFeature(format!(
            "{}: VHDX images are not supported",
            ctx.disk_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vms_block::MemoryBackend;

    #[test]
    fn signature_at_offset_zero_only() {
        let mut bytes = b"vhdxfile".to_vec();
        bytes.resize(4096, 0);
        assert!(VhdxFormat.probe(&MemoryBackend::new(bytes)).expect("probe"));

        let mut shifted = vec![0_u8; 512];
        shifted.extend_from_slice(VHDX_SIGNATURE);
        assert!(!VhdxFormat.probe(&MemoryBackend::new(shifted)).expect("probe"));
        assert!(!VhdxFormat.probe(&MemoryBackend::new(b"vhdx".to_vec())).expect("short"));
    }
}
