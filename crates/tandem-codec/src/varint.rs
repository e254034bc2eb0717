//! Variable-length unsigned integers.
//!
//! The two low bits of the first byte select the total width: `0` for one
//! byte, `1` for two, `2` for four and `3` for eight. The value occupies the
//! remaining bits, shifted left by two, little-endian. The largest encodable
//! value is therefore `2^62 - 1`.

use bytes::{BufMut, BytesMut};

use crate::error::{CodecError, Result};

/// Largest value a varulong can carry
pub const VARULONG_MAX: u64 = (1 << 62) - 1;

/// Number of bytes needed to encode `value`
#[must_use]
pub fn varulong_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Width of a varulong, decoded from its first byte
#[must_use]
pub fn varulong_len_from_prefix(first: u8) -> usize {
    1 << (first & 0x03)
}

/// Append `value` to `buf`.
///
/// # Errors
///
/// Returns `CodecError::InvalidData` if `value` exceeds [`VARULONG_MAX`].
pub fn encode_varulong(value: u64, buf: &mut BytesMut) -> Result<()> {
    if value > VARULONG_MAX {
        return Err(CodecError::invalid(format!(
            "varulong value {value} exceeds 2^62 - 1"
        )));
    }
    match varulong_len(value) {
        1 => buf.put_u8((value << 2) as u8),
        2 => buf.put_u16_le(((value << 2) | 1) as u16),
        4 => buf.put_u32_le(((value << 2) | 2) as u32),
        _ => buf.put_u64_le((value << 2) | 3),
    }
    Ok(())
}

/// Decode a varulong from the start of `data`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns `CodecError::UnexpectedEnd` if `data` is shorter than the width
/// announced by its first byte.
pub fn decode_varulong(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data.first().ok_or(CodecError::UnexpectedEnd {
        needed: 1,
        remaining: 0,
    })?;
    let len = varulong_len_from_prefix(first);
    if data.len() < len {
        return Err(CodecError::UnexpectedEnd {
            needed: len,
            remaining: data.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw[..len].copy_from_slice(&data[..len]);
    Ok((u64::from_le_bytes(raw) >> 2, len))
}
