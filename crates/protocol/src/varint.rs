//! Unsigned LEB128 varints.
//!
//! Seven bits per byte, least-significant group first, high bit set on every
//! byte except the last. This is the same encoding protobuf uses for its
//! `uint64` fields and for length-delimited message prefixes.

use bytes::BufMut;

use crate::error::{ProtocolError, Result};

/// Longest possible encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

const CONTINUATION: u8 = 0x80;
const PAYLOAD_MASK: u8 = 0x7F;

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    // ceil(bits / 7); zero still takes one byte
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Appends the varint encoding of `value` to `buf`.
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= u64::from(CONTINUATION) {
        buf.put_u8((value as u8 & PAYLOAD_MASK) | CONTINUATION);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decodes a varint from the start of `data`.
///
/// Returns `Ok(None)` when `data` ends before the terminating byte; nothing is
/// considered consumed in that case. On success returns the value and the
/// number of bytes it occupied.
///
/// # Errors
///
/// [`ProtocolError::MalformedLength`] if the accumulated value would need more
/// than 64 bits.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for (index, &byte) in data.iter().enumerate() {
        let group = u64::from(byte & PAYLOAD_MASK);

        // Only the lowest bit of the tenth byte still fits in a u64.
        if shift == 63 && group > 1 {
            return Err(ProtocolError::MalformedLength);
        }
        value |= group << shift;

        if byte & CONTINUATION == 0 {
            return Ok(Some((value, index + 1)));
        }

        shift += 7;
        if shift > 63 {
            return Err(ProtocolError::MalformedLength);
        }
    }

    Ok(None)
}
