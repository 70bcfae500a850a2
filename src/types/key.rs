//! Storage key encoding for data types
//!
//! ```text
//! ┌──────────┬──────────────────┬──────────────┬────────────────┐
//! │ tag (u8) │ key length u32BE │ user key     │ suffix (opt.)  │
//! └──────────┴──────────────────┴──────────────┴────────────────┘
//! ```
//!
//! Every type owns a tag, so types share one sorted key space without
//! colliding, and all records derived from one user key sort together.

use bytes::BufMut;

pub const TYPE_STRING: u8 = 1;
pub const TYPE_LIST: u8 = 2;

/// tag + length
pub const KEY_PREFIX_SIZE: usize = 1 + 4;

pub fn encoded_len(key: &[u8], suffix: &[u8]) -> usize {
    KEY_PREFIX_SIZE + key.len() + suffix.len()
}

pub fn encode_key(tag: u8, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(key, &[]));
    encode_key_into(&mut buf, tag, key, &[]);
    buf
}

/// Append the storage key for `key` (plus `suffix`) to `buf`
pub fn encode_key_into(buf: &mut Vec<u8>, tag: u8, key: &[u8], suffix: &[u8]) {
    buf.reserve(encoded_len(key, suffix));
    buf.put_u8(tag);
    buf.put_u32(key.len() as u32);
    buf.put_slice(key);
    buf.put_slice(suffix);
}

/// Split a storage key into `(tag, user key, suffix)`
pub fn decode_key(storage_key: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    if storage_key.len() < KEY_PREFIX_SIZE {
        return None;
    }
    let tag = storage_key[0];
    let mut len = [0u8; 4];
    len.copy_from_slice(&storage_key[1..KEY_PREFIX_SIZE]);
    let len = u32::from_be_bytes(len) as usize;
    let rest = &storage_key[KEY_PREFIX_SIZE..];
    if rest.len() < len {
        return None;
    }
    let (key, suffix) = rest.split_at(len);
    Some((tag, key, suffix))
}

/// Type tag of a well-formed storage key
pub fn type_tag(storage_key: &[u8]) -> Option<u8> {
    decode_key(storage_key).map(|(tag, _, _)| tag)
}
