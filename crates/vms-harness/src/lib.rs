#![forbid(unsafe_code)]
//! Synthetic images for vmscan tests.
//!
//! Every builder writes bytes by hand from the published on-disk layouts
//! rather than through the crates under test, so a decoder bug cannot be
//! hidden by a matching encoder bug.

pub mod ext4;
pub mod lvm;
pub mod ntfs;
pub mod partition;
pub mod sparse;
pub mod thin;

pub const SECTOR: usize = 512;

/// Write `value` little-endian at `offset`.
pub fn put_le(buf: &mut [u8], offset: usize, value: u64, width: usize) {
    buf[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
}

/// Write `value` big-endian at `offset`.
pub fn put_be(buf: &mut [u8], offset: usize, value: u64, width: usize) {
    buf[offset..offset + width].copy_from_slice(&value.to_be_bytes()[8 - width..]);
}

/// Copy `bytes` into `buf` at `offset`, growing `buf` when needed.
pub fn place(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    if buf.len() < offset + bytes.len() {
        buf.resize(offset + bytes.len(), 0);
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// Deterministic filler so reads can be checked byte for byte.
#[must_use]
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8).wrapping_mul(31))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endian_writers() {
        let mut buf = [0_u8; 8];
        put_le(&mut buf, 0, 0x1234, 2);
        put_be(&mut buf, 2, 0xAABB_CCDD, 4);
        assert_eq!(buf, [0x34, 0x12, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0]);
    }

    #[test]
    fn place_grows_the_buffer() {
        let mut buf = vec![1_u8; 2];
        place(&mut buf, 4, &[9, 9]);
        assert_eq!(buf, vec![1, 1, 0, 0, 9, 9]);
    }

    #[test]
    fn pattern_is_deterministic() {
        assert_eq!(pattern(3, 300), pattern(3, 300));
        assert_ne!(pattern(3, 16), pattern(4, 16));
    }
}
