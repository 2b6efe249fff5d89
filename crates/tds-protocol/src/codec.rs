//! Codec utilities for TDS protocol encoding and decoding.
//!
//! The physical packet header is big-endian while the SMP sub-header and
//! almost every token payload is little-endian. These helpers make the byte
//! order explicit at each call site instead of relying on host order.

/// Byte order of a multi-byte integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    /// Least significant byte first (TDS token payloads, SMP header).
    #[default]
    Little,
    /// Most significant byte first (physical packet header).
    Big,
}

impl Endian {
    /// Encode a `u16` in this byte order.
    #[must_use]
    pub const fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Encode a `u32` in this byte order.
    #[must_use]
    pub const fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    /// Encode a `u64` in this byte order.
    #[must_use]
    pub const fn u64_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

fn array<const N: usize>(buf: &[u8], at: usize) -> Option<[u8; N]> {
    let end = at.checked_add(N)?;
    buf.get(at..end)?.try_into().ok()
}

/// Read a big-endian `u16` at `at`, or `None` if out of bounds.
#[must_use]
pub fn read_u16_be(buf: &[u8], at: usize) -> Option<u16> {
    array(buf, at).map(u16::from_be_bytes)
}

/// Read a little-endian `u16` at `at`, or `None` if out of bounds.
#[must_use]
pub fn read_u16_le(buf: &[u8], at: usize) -> Option<u16> {
    array(buf, at).map(u16::from_le_bytes)
}

/// Read a little-endian `u32` at `at`, or `None` if out of bounds.
#[must_use]
pub fn read_u32_le(buf: &[u8], at: usize) -> Option<u32> {
    array(buf, at).map(u32::from_le_bytes)
}

/// Write `bytes` at `at`. Returns `false` without writing if out of bounds.
pub fn write_at(buf: &mut [u8], at: usize, bytes: &[u8]) -> bool {
    let Some(end) = at.checked_add(bytes.len()) else {
        return false;
    };
    match buf.get_mut(at..end) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

/// Write a big-endian `u16` at `at`.
pub fn write_u16_be(buf: &mut [u8], at: usize, value: u16) -> bool {
    write_at(buf, at, &value.to_be_bytes())
}

/// Write a little-endian `u16` at `at`.
pub fn write_u16_le(buf: &mut [u8], at: usize, value: u16) -> bool {
    write_at(buf, at, &value.to_le_bytes())
}

/// Write a little-endian `u32` at `at`.
pub fn write_u32_le(buf: &mut [u8], at: usize, value: u32) -> bool {
    write_at(buf, at, &value.to_le_bytes())
}

/// Signed distance `a - b` between two wrapping 32-bit sequence numbers.
///
/// SMP sequence and window fields wrap at 2^32; comparing them through the
/// signed difference keeps flow control correct across the wrap.
#[must_use]
pub const fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endian_bytes() {
        assert_eq!(Endian::Little.u16_bytes(0x1234), [0x34, 0x12]);
        assert_eq!(Endian::Big.u16_bytes(0x1234), [0x12, 0x34]);
        assert_eq!(Endian::Little.u32_bytes(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(Endian::Big.u64_bytes(1), [0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_read_write_bounds() {
        let mut buf = [0u8; 6];
        assert!(write_u16_be(&mut buf, 0, 0xABCD));
        assert!(write_u32_le(&mut buf, 2, 0x0102_0304));
        assert!(!write_u32_le(&mut buf, 3, 1));
        assert!(!write_u16_le(&mut buf, usize::MAX, 1));

        assert_eq!(read_u16_be(&buf, 0), Some(0xABCD));
        assert_eq!(read_u32_le(&buf, 2), Some(0x0102_0304));
        assert_eq!(read_u16_le(&buf, 5), None);
    }

    #[test]
    fn test_seq_diff_wraps() {
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
        assert_eq!(seq_diff(1, u32::MAX), 2);
        assert!(seq_diff(u32::MAX, 2) < 0);
    }
}
