//! Disk descriptors: what to open and how.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vms_block::{AccessMode, BlobSource, CacheConfig, DiskBackend};
use vms_error::{Result, VmsError};

/// Parent chains deeper than this are rejected as misconfigured.
pub const MAX_PARENT_DEPTH: usize = 32;

/// Where the bytes of a disk come from.
#[derive(Clone)]
pub enum DiskSource {
    /// Image file on a local or mounted filesystem.
    LocalFile(PathBuf),
    /// Raw block device node.
    BlockDevice(PathBuf),
    /// Remote blob or managed disk, accessed through a caller-supplied client.
    Remote(Arc<dyn BlobSource>),
    /// Handle already opened by the caller (hypervisor-mediated access).
    Backend(Arc<dyn DiskBackend>),
}

impl fmt::Debug for DiskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalFile(path) => f.debug_tuple("LocalFile").field(path).finish(),
            Self::BlockDevice(path) => f.debug_tuple("BlockDevice").field(path).finish(),
            Self::Remote(source) => f.debug_tuple("Remote").field(&source.locator()).finish(),
            Self::Backend(backend) => f.debug_tuple("Backend").field(&backend.kind()).finish(),
        }
    }
}

impl DiskSource {
    /// Identifier used in logs and error context.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::LocalFile(path) | Self::BlockDevice(path) => path.display().to_string(),
            Self::Remote(source) => source.locator().to_owned(),
            Self::Backend(backend) => format!("<{} handle>", backend.kind()),
        }
    }
}

/// Validated description of one virtual disk.
#[derive(Debug, Clone)]
pub struct DiskDescriptor {
    pub source: DiskSource,
    pub mode: AccessMode,
    /// Return the deepest copy-on-write parent instead of the leaf.
    pub base_only: bool,
    /// Skip format probing and treat the source as a flat disk.
    pub raw: bool,
    /// VM-level controller slot, e.g. `scsi0:0` or `ide1:0`.
    pub hardware_id: Option<String>,
    /// Byte offset of the disk inside a flat source.
    pub offset: u64,
    /// Backing parent for differencing and snapshot formats.
    pub parent: Option<Box<DiskDescriptor>>,
    /// Block cache for remote sources; `None` uses [`CacheConfig::default`].
    pub cache: Option<CacheConfig>,
}

impl DiskDescriptor {
    #[must_use]
    pub fn new(source: DiskSource) -> Self {
        Self {
            source,
            mode: AccessMode::ReadOnly,
            base_only: false,
            raw: false,
            hardware_id: None,
            offset: 0,
            parent: None,
            cache: None,
        }
    }

    #[must_use]
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::new(DiskSource::LocalFile(path.as_ref().to_path_buf()))
    }

    #[must_use]
    pub fn block_device(path: impl AsRef<Path>) -> Self {
        Self::new(DiskSource::BlockDevice(path.as_ref().to_path_buf()))
    }

    #[must_use]
    pub fn remote(source: Arc<dyn BlobSource>) -> Self {
        Self::new(DiskSource::Remote(source))
    }

    #[must_use]
    pub fn backend(backend: Arc<dyn DiskBackend>) -> Self {
        Self::new(DiskSource::Backend(backend))
    }

    #[must_use]
    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_hardware_id(mut self, id: impl Into<String>) -> Self {
        self.hardware_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_base_only(mut self, base_only: bool) -> Self {
        self.base_only = base_only;
        self
    }

    #[must_use]
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: DiskDescriptor) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Name used for the opened disk: the hardware id when present.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.hardware_id
            .clone()
            .unwrap_or_else(|| self.source.label())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_depth(0)
    }

    fn validate_depth(&self, depth: usize) -> Result<()> {
        if depth > MAX_PARENT_DEPTH {
            return Err(VmsError::InvalidConfig(format!(
                "parent chain deeper than {MAX_PARENT_DEPTH}"
            )));
        }
        match &self.source {
            DiskSource::LocalFile(path) | DiskSource::BlockDevice(path)
                if path.as_os_str().is_empty() =>
            {
                return Err(VmsError::InvalidConfig("empty disk path".to_owned()));
            }
            DiskSource::Remote(source) if self.mode.is_writable() => {
                return Err(VmsError::InvalidConfig(format!(
                    "remote disk {} cannot be opened read-write",
                    source.locator()
                )));
            }
            _ => {}
        }
        if self.raw && self.parent.is_some() {
            return Err(VmsError::InvalidConfig(format!(
                "{}: a raw disk cannot have a parent",
                self.display_name()
            )));
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        if let Some(parent) = &self.parent {
            parent.validate_depth(depth + 1)?;
        }
        Ok(())
    }
}
