//! Byte-slice utilities for bounds-oriented parsing.
//!
//! Two layers, same as everywhere else in the crate:
//! - **Option layer** (`read_*`): return `Option<T>`, for callers that map failures to their
//!   own error.
//! - **Result layer** (`*_r`): map `None` to [`DecodeError::Truncated`].
//!
//! All numeric reads are little-endian (every MSF/PDB structure is LE). Offsets are relative
//! to the slice passed in.
//!
//! ```ignore
//! use crate::utils::bytes;
//!
//! let _ = bytes::slice_r(buf, 0, 56, "TPI header")?;
//! let version = bytes::read_u32_le_r(buf, 0, "TPI version")?;
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::err::DecodeError;

/// Read `N` raw bytes at `offset`.
pub(crate) fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    buf.get(offset..end)?.try_into().ok()
}

pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    buf.get(offset..end).map(LittleEndian::read_u16)
}

pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    buf.get(offset..end).map(LittleEndian::read_u32)
}

pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(8)?;
    buf.get(offset..end).map(LittleEndian::read_u64)
}

#[inline]
pub(crate) fn truncated(what: &'static str, offset: usize, need: usize, len: usize) -> DecodeError {
    DecodeError::Truncated {
        what,
        offset: offset as u64,
        need,
        have: len.saturating_sub(offset),
    }
}

pub(crate) fn slice_r<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], DecodeError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| truncated(what, offset, len, buf.len()))?;
    buf.get(offset..end)
        .ok_or_else(|| truncated(what, offset, len, buf.len()))
}

pub(crate) fn read_u16_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u16, DecodeError> {
    read_u16_le(buf, offset).ok_or_else(|| truncated(what, offset, 2, buf.len()))
}

pub(crate) fn read_u32_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> Result<u32, DecodeError> {
    read_u32_le(buf, offset).ok_or_else(|| truncated(what, offset, 4, buf.len()))
}

/// Read a `count`-element `u32` table at `offset`, with a single bounds check for the table.
pub(crate) fn read_u32_vec_le_r(
    buf: &[u8],
    offset: usize,
    count: usize,
    what: &'static str,
) -> Result<Vec<u32>, DecodeError> {
    let bytes = count
        .checked_mul(4)
        .ok_or_else(|| truncated(what, offset, usize::MAX, buf.len()))?;
    let table = slice_r(buf, offset, bytes, what)?;

    Ok(table.chunks_exact(4).map(LittleEndian::read_u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian_values() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u16_le(&buf, 0), Some(0x0201));
        assert_eq!(read_u32_le(&buf, 4), Some(0x0807_0605));
        assert_eq!(read_u64_le(&buf, 0), Some(0x0807_0605_0403_0201));
        assert_eq!(read_array::<3>(&buf, 5), Some([0x06, 0x07, 0x08]));
        assert_eq!(read_u8(&buf, 8), None);
    }

    #[test]
    fn test_out_of_range_reads_are_truncated_errors() {
        let buf = [0_u8; 6];
        assert_eq!(read_u32_le(&buf, 4), None);
        assert_eq!(read_u32_le(&buf, usize::MAX), None);

        let err = read_u32_le_r(&buf, 4, "value").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                what: "value",
                offset: 4,
                need: 4,
                have: 2,
            }
        );
    }

    #[test]
    fn test_reads_u32_table() {
        let buf = [1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];
        assert_eq!(read_u32_vec_le_r(&buf, 4, 2, "table").unwrap(), vec![2, 3]);
        assert!(read_u32_vec_le_r(&buf, 4, 3, "table").is_err());
    }
}
