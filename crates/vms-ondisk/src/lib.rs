#![forbid(unsafe_code)]
//! On-disk structure decoders for the filesystems vmscan reads.
//!
//! Everything here works on in-memory byte slices and returns
//! [`vms_types::ParseError`]; reading from devices and caching belong to
//! `vms-fs`.

pub mod ext4;
pub mod ntfs;
