#![forbid(unsafe_code)]
//! Error types for vmscan.
//!
//! # Error Taxonomy
//!
//! vmscan uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vms-types` | Format violations detected while decoding an in-memory buffer |
//! | Runtime | `VmsError` | `vms-error` (this crate) | Errors returned by disks, volumes, filesystems and mount trees |
//!
//! A failed signature check is not an error at all. Probes return `Option`
//! so the next candidate format can be tried; only a structure that fails
//! validation *after* a layer committed to a format becomes a `VmsError`.
//!
//! ## Classes
//!
//! Every variant belongs to exactly one [`ErrorClass`]:
//!
//! | Variant | Class |
//! |---------|-------|
//! | `Io` | `IoFailure` |
//! | `Corruption`, `Format` | `CorruptStructure` |
//! | `UnsupportedOperation`, `UnsupportedFeature`, `ReadOnly` | `UnsupportedOperation` |
//! | `UnmappedExtent` | `UnmappedExtent` |
//! | `ResourceExhausted` | `ResourceExhausted` |
//! | `NotFound`, `NotDirectory`, `IsDirectory`, `NotSymlink`, `SymlinkLoop` | `Lookup` |
//! | `InvalidConfig`, `Closed` | `Usage` |
//!
//! ## Design Constraints
//!
//! - `vms-error` MUST NOT depend on `vms-types` (no cyclic deps). The
//!   `ParseError` conversion is `vms_types::parse_error_to_vms`.
//! - All payloads are owned so errors can outlive the buffers they describe.

use serde::Serialize;
use thiserror::Error;

/// Unified error type for all vmscan operations.
#[derive(Debug, Error)]
pub enum VmsError {
    /// Transport error from the backing store (local file, block device or
    /// remote request). Propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structure failed an internal invariant after its layer committed
    /// to a format. `context` names the device or structure and offset.
    #[error("corrupt structure in {context}: {detail}")]
    Corruption { context: String, detail: String },

    /// Invalid on-disk format detected while decoding a committed layer.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Operation not available on this backend (e.g. write to a remote blob).
    #[error("{operation} is not supported by {target}")]
    UnsupportedOperation { operation: String, target: String },

    /// Recognised on-disk variant that is not implemented.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Logical address not backed by any extent of a plain logical volume.
    #[error("unmapped extent in {volume}: offset {offset} length {len}")]
    UnmappedExtent { volume: String, offset: u64, len: u64 },

    /// Allocation failed (grain allocation beyond capacity, no free slot).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Write attempted on a device opened read-only.
    #[error("read-only device")]
    ReadOnly,

    /// Path or named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// Attempted a file operation on a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),

    /// `read_link` on something that is not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotSymlink(String),

    /// Symlink expansion exceeded the follow bound.
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    /// A configuration struct failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation on a device or volume after it was closed.
    #[error("{0} is closed")]
    Closed(String),
}

/// Coarse classification used by callers deciding whether to skip a
/// device, volume or filesystem and continue with the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    IoFailure,
    CorruptStructure,
    UnsupportedOperation,
    UnmappedExtent,
    ResourceExhausted,
    Lookup,
    Usage,
}

impl VmsError {
    /// Map this error to its class. The match is exhaustive so a new
    /// variant cannot be added without choosing a class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::IoFailure,
            Self::Corruption { .. } | Self::Format(_) => ErrorClass::CorruptStructure,
            Self::UnsupportedOperation { .. } | Self::UnsupportedFeature(_) | Self::ReadOnly => {
                ErrorClass::UnsupportedOperation
            }
            Self::UnmappedExtent { .. } => ErrorClass::UnmappedExtent,
            Self::ResourceExhausted(_) => ErrorClass::ResourceExhausted,
            Self::NotFound(_)
            | Self::NotDirectory(_)
            | Self::IsDirectory(_)
            | Self::NotSymlink(_)
            | Self::SymlinkLoop(_) => ErrorClass::Lookup,
            Self::InvalidConfig(_) | Self::Closed(_) => ErrorClass::Usage,
        }
    }

    /// Shorthand for [`VmsError::Corruption`].
    pub fn corruption(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corruption {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Shorthand for [`VmsError::UnsupportedOperation`].
    pub fn unsupported_op(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            target: target.into(),
        }
    }

    /// True for errors where the requested path simply does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `VmsError`.
pub type Result<T, E = VmsError> = std::result::Result<T, E>;
