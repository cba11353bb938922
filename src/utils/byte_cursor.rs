use crate::err::{DecodeError, DecodeResult};
use crate::utils::bytes;

/// A lightweight cursor over an immutable byte slice.
///
/// This is the slice/offset equivalent of `Cursor<&[u8]>`: every stream is already in memory,
/// so reads are explicit bounds checks rather than IO calls.
///
/// All reads are little-endian and advance the cursor on success. A failed primitive read
/// leaves the position untouched.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    #[inline]
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub(crate) fn with_pos(buf: &'a [u8], pos: usize) -> DecodeResult<Self> {
        // Allow pos == len (EOF), reject pos > len.
        let _ = bytes::slice_r(buf, pos, 0, "cursor.position")?;
        Ok(Self { buf, pos })
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    #[inline]
    pub(crate) fn advance(&mut self, n: usize, what: &'static str) -> DecodeResult<()> {
        let _ = self.take_bytes(n, what)?;
        Ok(())
    }

    /// Skip forward to the next multiple of `alignment` (relative to the start of the buffer).
    pub(crate) fn align(&mut self, alignment: usize, what: &'static str) -> DecodeResult<()> {
        let misalignment = self.pos % alignment;
        if misalignment != 0 {
            self.advance(alignment - misalignment, what)?;
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn take_bytes(&mut self, len: usize, what: &'static str) -> DecodeResult<&'a [u8]> {
        let out = bytes::slice_r(self.buf, self.pos, len, what)?;
        self.pos += len;
        Ok(out)
    }

    #[inline]
    pub(crate) fn array<const N: usize>(&mut self, what: &'static str) -> DecodeResult<[u8; N]> {
        let v = bytes::read_array::<N>(self.buf, self.pos)
            .ok_or_else(|| bytes::truncated(what, self.pos, N, self.buf.len()))?;
        self.pos += N;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u8_named(&mut self, what: &'static str) -> DecodeResult<u8> {
        let b = bytes::read_u8(self.buf, self.pos)
            .ok_or_else(|| bytes::truncated(what, self.pos, 1, self.buf.len()))?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    pub(crate) fn u16_named(&mut self, what: &'static str) -> DecodeResult<u16> {
        let v = bytes::read_u16_le_r(self.buf, self.pos, what)?;
        self.pos += 2;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u32_named(&mut self, what: &'static str) -> DecodeResult<u32> {
        let v = bytes::read_u32_le_r(self.buf, self.pos, what)?;
        self.pos += 4;
        Ok(v)
    }

    #[inline]
    pub(crate) fn i32_named(&mut self, what: &'static str) -> DecodeResult<i32> {
        self.u32_named(what).map(|v| v as i32)
    }

    #[inline]
    pub(crate) fn u64_named(&mut self, what: &'static str) -> DecodeResult<u64> {
        let v = bytes::read_u64_le(self.buf, self.pos)
            .ok_or_else(|| bytes::truncated(what, self.pos, 8, self.buf.len()))?;
        self.pos += 8;
        Ok(v)
    }

    /// Read bytes up to (and consume) a NUL terminator.
    ///
    /// Returns the bytes without the terminator. A missing terminator is an error: names are
    /// never allowed to run off the end of their record.
    pub(crate) fn c_str_bytes(&mut self, what: &'static str) -> DecodeResult<&'a [u8]> {
        let rest = self.buf.get(self.pos..).unwrap_or(&[]);
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bytes::truncated(what, self.pos, rest.len() + 1, self.buf.len()))?;
        let out = &rest[..len];
        self.pos += len + 1;
        Ok(out)
    }

    /// Read a NUL-terminated string, replacing invalid UTF-8 sequences.
    pub(crate) fn c_str_lossy(&mut self, what: &'static str) -> DecodeResult<String> {
        self.c_str_bytes(what)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    /// Read a CodeView numeric leaf.
    ///
    /// Values below `0x8000` are stored inline in the leading `u16`; larger values are
    /// introduced by a leaf tag naming their width. Negative values are rejected since every
    /// numeric leaf this crate reads is a size or a count.
    pub(crate) fn numeric_leaf(&mut self, what: &'static str) -> DecodeResult<u64> {
        let start = self.pos;
        let leaf = self.u16_named(what)?;
        if leaf < 0x8000 {
            return Ok(u64::from(leaf));
        }

        let signed: i64 = match leaf {
            0x8000 => i64::from(self.u8_named(what)? as i8),
            0x8001 => i64::from(self.u16_named(what)? as i16),
            0x8002 => return Ok(u64::from(self.u16_named(what)?)),
            0x8003 => i64::from(self.i32_named(what)?),
            0x8004 => return Ok(u64::from(self.u32_named(what)?)),
            0x8009 => self.u64_named(what)? as i64,
            0x800a => return self.u64_named(what),
            other => {
                return Err(DecodeError::malformed(
                    what,
                    start,
                    format!("unsupported numeric leaf 0x{other:04X}"),
                ));
            }
        };

        u64::try_from(signed)
            .map_err(|_| DecodeError::malformed(what, start, format!("negative value {signed}")))
    }
}
