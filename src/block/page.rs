//! Record page
//!
//! A fixed-capacity byte region holding densely packed records in ascending
//! key order, plus an offset table for binary search. Shared by data blocks
//! and index blocks.

use std::cmp::Ordering;

use super::record::{record_len, RecordRef};
use crate::error::Result;
use crate::memory::Allocator;

/// Result of a key search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Key present at this position
    Found(usize),
    /// Key absent; this is where it would be inserted
    Vacant(usize),
}

#[derive(Debug, Clone)]
pub struct RecordPage {
    /// Backing region; `buf.len()` is the capacity
    buf: Vec<u8>,
    used: usize,
    offsets: Vec<u32>,
}

impl RecordPage {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            used: 0,
            offsets: Vec::new(),
        }
    }

    /// Rebuild a page from packed records
    pub fn from_bytes(bytes: &[u8], capacity: usize) -> Self {
        let capacity = capacity.max(bytes.len());
        let mut buf = vec![0u8; capacity];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            offsets: scan_offsets(bytes, 0),
            buf,
            used: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_space(&self) -> usize {
        self.buf.len() - self.used
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn used_bytes(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    pub fn record(&self, index: usize) -> RecordRef<'_> {
        RecordRef::new(&self.buf[self.offsets[index] as usize..self.used])
    }

    pub fn records(&self) -> impl Iterator<Item = RecordRef<'_>> + '_ {
        (0..self.len()).map(move |i| self.record(i))
    }

    /// Binary search for `key`
    pub fn search(&self, alloc: &dyn Allocator, key: &[u8]) -> Result<Slot> {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record(mid).compare_key(alloc, key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Slot::Found(mid)),
            }
        }
        Ok(Slot::Vacant(lo))
    }

    /// Position of the last record whose key is `<= key`
    pub fn floor(&self, alloc: &dyn Allocator, key: &[u8]) -> Result<Option<usize>> {
        Ok(match self.search(alloc, key)? {
            Slot::Found(i) => Some(i),
            Slot::Vacant(0) => None,
            Slot::Vacant(i) => Some(i - 1),
        })
    }

    /// Insert an encoded record at `index`; false if it does not fit
    pub fn insert(&mut self, index: usize, record: &[u8]) -> bool {
        let len = record.len();
        if len > self.free_space() {
            return false;
        }
        let offset = if index < self.len() {
            self.offsets[index] as usize
        } else {
            self.used
        };
        self.buf.copy_within(offset..self.used, offset + len);
        self.buf[offset..offset + len].copy_from_slice(record);
        self.used += len;
        for o in &mut self.offsets[index..] {
            *o += len as u32;
        }
        self.offsets.insert(index, offset as u32);
        true
    }

    pub fn remove(&mut self, index: usize) {
        let offset = self.offsets[index] as usize;
        let len = self.record(index).len();
        self.buf.copy_within(offset + len..self.used, offset);
        self.used -= len;
        self.offsets.remove(index);
        for o in &mut self.offsets[index..] {
            *o -= len as u32;
        }
    }

    /// Overwrite the record at `index`; false if the page lacks room
    pub fn replace(&mut self, index: usize, record: &[u8]) -> bool {
        let offset = self.offsets[index] as usize;
        let old_len = self.record(index).len();
        let new_len = record.len();
        if self.used - old_len + new_len > self.capacity() {
            return false;
        }
        if new_len != old_len {
            self.buf
                .copy_within(offset + old_len..self.used, offset + new_len);
            for o in &mut self.offsets[index + 1..] {
                *o = (*o as usize + new_len - old_len) as u32;
            }
            self.used = self.used + new_len - old_len;
        }
        self.buf[offset..offset + new_len].copy_from_slice(record);
        true
    }

    /// Mutable access to the value field of an inline-valued record
    pub fn value_field_mut(&mut self, index: usize) -> &mut [u8] {
        let offset = self.offsets[index] as usize;
        let rec = self.record(index);
        let start = offset + rec.value_field_offset();
        let end = offset + rec.len();
        &mut self.buf[start..end]
    }

    /// Change the capacity; never below the used bytes
    pub fn resize_capacity(&mut self, capacity: usize) {
        self.buf.resize(capacity.max(self.used), 0);
        self.buf.shrink_to_fit();
    }

    /// Split position balancing bytes, not record counts.
    ///
    /// The record straddling the byte midpoint goes to whichever side leaves
    /// the cut closer to the midpoint (left on a tie). Always in `[1, len-1]`.
    pub fn split_index(&self) -> usize {
        let n = self.len();
        if n < 2 {
            return n;
        }
        let target = self.used / 2;
        let mut index = n - 1;
        for i in 0..n {
            let start = self.offsets[i] as usize;
            let end = start + self.record(i).len();
            if end >= target {
                index = if target - start <= end - target { i } else { i + 1 };
                break;
            }
        }
        index.clamp(1, n - 1)
    }

    /// Remove records `[at..]`, returning their packed bytes
    pub fn split_off(&mut self, at: usize) -> Vec<u8> {
        if at >= self.len() {
            return Vec::new();
        }
        let offset = self.offsets[at] as usize;
        let tail = self.buf[offset..self.used].to_vec();
        self.used = offset;
        self.offsets.truncate(at);
        tail
    }

    /// Append packed records that sort after every record here
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_space() {
            return false;
        }
        let base = self.used;
        self.buf[base..base + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        self.offsets.extend(scan_offsets(bytes, base));
        true
    }
}

fn scan_offsets(bytes: &[u8], base: usize) -> Vec<u32> {
    let mut offsets = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        offsets.push((base + pos) as u32);
        pos += record_len(&bytes[pos..]);
    }
    offsets
}
