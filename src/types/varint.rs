//! LEB128 variable-length integers
//!
//! Seven payload bits per byte, least significant group first; the high bit
//! marks a continuation. Used for element length prefixes inside list
//! segments, where most elements are short.
//!
//! | Value Range        | Bytes |
//! |--------------------|-------|
//! | 0 - 127            | 1     |
//! | 128 - 16383        | 2     |
//! | 16384 - 2097151    | 3     |
//! | ...                | ...   |
//! | up to u64::MAX     | 10    |

use bytes::BufMut;

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    (bits.max(1) + 6) / 7
}

/// Append the encoding of `value`, returning bytes written
pub fn encode_varint(value: u64, buf: &mut impl BufMut) -> usize {
    let mut v = value;
    let mut written = 0;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        written += 1;
        if v == 0 {
            buf.put_u8(byte);
            return written;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode a varint from the front of `buf`, returning `(value, bytes_read)`.
/// `None` for truncated or overlong input.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = (byte & 0x7F) as u64;
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return None;
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
