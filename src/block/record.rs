//! Record layout
//!
//! ```text
//! ┌───────┬─────────┬─────────┬──────────┬───────────┬─────────────┐
//! │ flags │ key_len │ val_len │ [expire] │ key field │ value field │
//! │  u8   │ u32 LE  │ u32 LE  │  u64 LE  │           │             │
//! └───────┴─────────┴─────────┴──────────┴───────────┴─────────────┘
//! ```
//!
//! Lengths are always the logical key/value lengths. A field stored outside
//! the block is replaced by the 8-byte little-endian address of its region.

use std::borrow::Cow;
use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use super::{BlockContext, Entry, RecordOptions};
use crate::error::Result;
use crate::memory::{Address, Allocator};

/// Fixed bytes before the optional expire field
pub const RECORD_HEADER_SIZE: usize = 9;

/// Size of the optional expire field
pub const EXPIRE_SIZE: usize = 8;

/// Size of an inline reference to an external field
pub const ADDRESS_SIZE: usize = 8;

pub const FLAG_EXTERNAL_KEY: u8 = 0x01;
pub const FLAG_EXTERNAL_VALUE: u8 = 0x02;
pub const FLAG_CUSTOM_TYPE: u8 = 0x04;
pub const FLAG_HAS_EXPIRE: u8 = 0x08;

/// Where the key and value of a record live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inline,
    ExternalValue,
    ExternalKey,
    ExternalBoth,
}

impl Placement {
    /// Placement for a data record: inline both, else move the value out,
    /// else move the key out, else move both out
    pub fn for_record(key_len: usize, value_len: usize, has_expire: bool, threshold: usize) -> Self {
        let base = RECORD_HEADER_SIZE + if has_expire { EXPIRE_SIZE } else { 0 };
        if base + key_len + value_len <= threshold {
            Placement::Inline
        } else if base + key_len + ADDRESS_SIZE <= threshold {
            Placement::ExternalValue
        } else if base + ADDRESS_SIZE + value_len <= threshold {
            Placement::ExternalKey
        } else {
            Placement::ExternalBoth
        }
    }

    /// Placement for an index entry, whose value is always an inline slot
    pub fn for_index_entry(key_len: usize, threshold: usize) -> Self {
        if RECORD_HEADER_SIZE + key_len + ADDRESS_SIZE <= threshold {
            Placement::Inline
        } else {
            Placement::ExternalKey
        }
    }

    pub fn external_key(self) -> bool {
        matches!(self, Placement::ExternalKey | Placement::ExternalBoth)
    }

    pub fn external_value(self) -> bool {
        matches!(self, Placement::ExternalValue | Placement::ExternalBoth)
    }

    pub fn flags(self) -> u8 {
        let mut flags = 0;
        if self.external_key() {
            flags |= FLAG_EXTERNAL_KEY;
        }
        if self.external_value() {
            flags |= FLAG_EXTERNAL_VALUE;
        }
        flags
    }

    /// Bytes the record occupies inside its block
    pub fn encoded_len(self, key_len: usize, value_len: usize, has_expire: bool) -> usize {
        RECORD_HEADER_SIZE
            + if has_expire { EXPIRE_SIZE } else { 0 }
            + if self.external_key() { ADDRESS_SIZE } else { key_len }
            + if self.external_value() { ADDRESS_SIZE } else { value_len }
    }

    fn from_flags(flags: u8) -> Self {
        match (flags & FLAG_EXTERNAL_KEY != 0, flags & FLAG_EXTERNAL_VALUE != 0) {
            (false, false) => Placement::Inline,
            (false, true) => Placement::ExternalValue,
            (true, false) => Placement::ExternalKey,
            (true, true) => Placement::ExternalBoth,
        }
    }
}

/// Whether a key/value pair is too large to live entirely inside a block
pub fn must_store_externally(key_len: usize, value_len: usize, threshold: usize) -> bool {
    Placement::for_record(key_len, value_len, false, threshold) != Placement::Inline
}

/// Length of the record starting at `bytes[0]`
pub fn record_len(bytes: &[u8]) -> usize {
    RecordRef::new(bytes).len()
}

/// Borrowed view of an encoded record
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordRef<'a> {
    /// `bytes` must start at a record header; trailing bytes are ignored
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn flags(&self) -> u8 {
        self.bytes[0]
    }

    pub fn placement(&self) -> Placement {
        Placement::from_flags(self.flags())
    }

    pub fn key_len(&self) -> usize {
        (&self.bytes[1..5]).get_u32_le() as usize
    }

    pub fn value_len(&self) -> usize {
        (&self.bytes[5..9]).get_u32_le() as usize
    }

    pub fn is_custom(&self) -> bool {
        self.flags() & FLAG_CUSTOM_TYPE != 0
    }

    pub fn expire(&self) -> Option<u64> {
        if self.flags() & FLAG_HAS_EXPIRE != 0 {
            Some((&self.bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + EXPIRE_SIZE]).get_u64_le())
        } else {
            None
        }
    }

    fn body_start(&self) -> usize {
        RECORD_HEADER_SIZE
            + if self.flags() & FLAG_HAS_EXPIRE != 0 {
                EXPIRE_SIZE
            } else {
                0
            }
    }

    fn key_field_len(&self) -> usize {
        if self.placement().external_key() {
            ADDRESS_SIZE
        } else {
            self.key_len()
        }
    }

    fn value_field_len(&self) -> usize {
        if self.placement().external_value() {
            ADDRESS_SIZE
        } else {
            self.value_len()
        }
    }

    /// Total encoded length of this record
    pub fn len(&self) -> usize {
        self.body_start() + self.key_field_len() + self.value_field_len()
    }

    /// Encoded bytes of exactly this record
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.bytes[..self.len()]
    }

    pub fn key_field(&self) -> &'a [u8] {
        let start = self.body_start();
        &self.bytes[start..start + self.key_field_len()]
    }

    pub fn value_field(&self) -> &'a [u8] {
        let start = self.body_start() + self.key_field_len();
        &self.bytes[start..start + self.value_field_len()]
    }

    /// Offset of the value field from the start of the record
    pub fn value_field_offset(&self) -> usize {
        self.body_start() + self.key_field_len()
    }

    pub fn key_address(&self) -> Option<Address> {
        self.placement()
            .external_key()
            .then(|| self.key_field().get_u64_le())
    }

    pub fn value_address(&self) -> Option<Address> {
        self.placement()
            .external_value()
            .then(|| self.value_field().get_u64_le())
    }

    pub fn key(&self, alloc: &dyn Allocator) -> Result<Cow<'a, [u8]>> {
        match self.key_address() {
            Some(addr) => Ok(Cow::Owned(alloc.load(addr)?)),
            None => Ok(Cow::Borrowed(self.key_field())),
        }
    }

    pub fn value(&self, alloc: &dyn Allocator) -> Result<Cow<'a, [u8]>> {
        match self.value_address() {
            Some(addr) => Ok(Cow::Owned(alloc.load(addr)?)),
            None => Ok(Cow::Borrowed(self.value_field())),
        }
    }

    /// Compare this record's key against `key`
    pub fn compare_key(&self, alloc: &dyn Allocator, key: &[u8]) -> Result<Ordering> {
        match self.key_address() {
            Some(addr) => alloc.compare(addr, key),
            None => Ok(self.key_field().cmp(key)),
        }
    }

    pub fn is_empty_key(&self) -> bool {
        self.key_len() == 0
    }

    pub fn to_entry(&self, alloc: &dyn Allocator) -> Result<Entry> {
        Ok(Entry {
            key: self.key(alloc)?.into_owned(),
            value: self.value(alloc)?.into_owned(),
            expire: self.expire(),
            custom: self.is_custom(),
        })
    }
}

/// Encode a record, copying oversized fields into external regions
pub fn build_record(
    ctx: &BlockContext,
    key: &[u8],
    value: &[u8],
    opts: &RecordOptions,
    placement: Placement,
) -> Result<Vec<u8>> {
    let key_address = if placement.external_key() {
        Some(ctx.store_external(key)?)
    } else {
        None
    };
    let value_address = if placement.external_value() {
        match ctx.store_external(value) {
            Ok(addr) => Some(addr),
            Err(e) => {
                if let Some(addr) = key_address {
                    ctx.free_external(addr)?;
                }
                return Err(e);
            }
        }
    } else {
        None
    };
    Ok(encode_record(key, value, opts, placement, key_address, value_address))
}

/// Regions of `old` an overwrite with `value` can keep: the key region when
/// the key stays external, the value region when it stays external with the
/// same length
fn reusable(old: RecordRef<'_>, value_len: usize, placement: Placement) -> (Option<Address>, Option<Address>) {
    let key = old.key_address().filter(|_| placement.external_key());
    let value = old
        .value_address()
        .filter(|_| placement.external_value() && old.value_len() == value_len);
    (key, value)
}

/// Whether overwriting `old` needs no memory beyond what it already holds
pub fn rewrite_is_free(old: RecordRef<'_>, value_len: usize, placement: Placement, new_len: usize) -> bool {
    let (key, value) = reusable(old, value_len, placement);
    new_len <= old.len()
        && (!placement.external_key() || key.is_some())
        && (!placement.external_value() || value.is_some())
}

/// Encode the replacement of `old` (same key), keeping its external regions
/// where possible. A kept value region is rewritten in place once every new
/// region is allocated. Returns the record and the regions of `old` that are
/// no longer referenced.
pub fn rebuild_record(
    ctx: &BlockContext,
    old: RecordRef<'_>,
    key: &[u8],
    value: &[u8],
    opts: &RecordOptions,
    placement: Placement,
) -> Result<(Vec<u8>, Vec<Address>)> {
    let (kept_key, kept_value) = reusable(old, value.len(), placement);
    let fresh_key = match kept_key {
        None if placement.external_key() => Some(ctx.store_external(key)?),
        _ => None,
    };
    let fresh_value = match kept_value {
        None if placement.external_value() => match ctx.store_external(value) {
            Ok(addr) => Some(addr),
            Err(e) => {
                if let Some(addr) = fresh_key {
                    ctx.free_external(addr)?;
                }
                return Err(e);
            }
        },
        _ => None,
    };
    if let Some(addr) = kept_value {
        ctx.allocator.write(addr, 0, value)?;
    }

    let mut unused = Vec::with_capacity(2);
    if let Some(addr) = old.key_address().filter(|a| kept_key != Some(*a)) {
        unused.push(addr);
    }
    if let Some(addr) = old.value_address().filter(|a| kept_value != Some(*a)) {
        unused.push(addr);
    }
    let record = encode_record(
        key,
        value,
        opts,
        placement,
        kept_key.or(fresh_key),
        kept_value.or(fresh_value),
    );
    Ok((record, unused))
}

fn encode_record(
    key: &[u8],
    value: &[u8],
    opts: &RecordOptions,
    placement: Placement,
    key_address: Option<Address>,
    value_address: Option<Address>,
) -> Vec<u8> {
    let mut flags = placement.flags();
    if opts.custom {
        flags |= FLAG_CUSTOM_TYPE;
    }
    if opts.expire.is_some() {
        flags |= FLAG_HAS_EXPIRE;
    }

    let mut buf = Vec::with_capacity(placement.encoded_len(
        key.len(),
        value.len(),
        opts.expire.is_some(),
    ));
    buf.put_u8(flags);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    if let Some(expire) = opts.expire {
        buf.put_u64_le(expire);
    }
    match key_address {
        Some(addr) => buf.put_u64_le(addr),
        None => buf.put_slice(key),
    }
    match value_address {
        Some(addr) => buf.put_u64_le(addr),
        None => buf.put_slice(value),
    }
    buf
}

/// Free the external regions a record references
pub fn release_record(ctx: &BlockContext, record: RecordRef<'_>) -> Result<()> {
    if let Some(addr) = record.key_address() {
        ctx.free_external(addr)?;
    }
    if let Some(addr) = record.value_address() {
        ctx.free_external(addr)?;
    }
    Ok(())
}
