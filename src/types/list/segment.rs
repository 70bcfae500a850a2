//! List segments
//!
//! A segment is one arena region holding a run of list elements plus the
//! handles of its neighbours:
//!
//! ```text
//! ┌───────────┬──────────────┬──────────┬──────────┬─────────────────────┐
//! │ count u32 │ data_len u32 │ prev u64 │ next u64 │ elements...         │
//! └───────────┴──────────────┴──────────┴──────────┴─────────────────────┘
//!                                                   element = [varint len][bytes]
//! ```
//!
//! A `Segment` value is a decoded working copy; nothing reaches the arena
//! until `store`. Neighbour handles can be patched in place with
//! `write_prev`/`write_next` without loading the neighbour.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use tracing::warn;

use crate::block::BlockContext;
use crate::error::{BasaltError, Result};
use crate::memory::{Address, NULL_ADDRESS};
use crate::types::varint::{decode_varint, encode_varint, varint_len};

pub const SEGMENT_HEADER_SIZE: usize = 24;

const PREV_OFFSET: usize = 8;
const NEXT_OFFSET: usize = 16;

/// Bytes one element occupies inside a segment
pub fn element_len(element: &[u8]) -> usize {
    varint_len(element.len() as u64) + element.len()
}

fn corrupted(address: Address, reason: &str) -> BasaltError {
    BasaltError::CorruptedValue(format!("list segment {}: {}", address, reason))
}

#[derive(Debug, Clone)]
pub struct Segment {
    address: Address,
    prev: Address,
    next: Address,
    elements: VecDeque<Vec<u8>>,
    data_len: usize,
}

impl Segment {
    /// Allocate a segment holding `elements`
    pub fn create(
        ctx: &BlockContext,
        prev: Address,
        next: Address,
        elements: VecDeque<Vec<u8>>,
    ) -> Result<Segment> {
        let data_len = elements.iter().map(|e| element_len(e)).sum();
        let mut segment = Segment {
            address: NULL_ADDRESS,
            prev,
            next,
            elements,
            data_len,
        };
        let image = segment.encode();
        let address = ctx.allocator.allocate(image.len())?;
        if let Err(e) = ctx.allocator.write(address, 0, &image) {
            let _ = ctx.allocator.free(address);
            return Err(e);
        }
        ctx.stats.add_external(image.len());
        segment.address = address;
        Ok(segment)
    }

    pub fn with_element(
        ctx: &BlockContext,
        prev: Address,
        next: Address,
        element: &[u8],
    ) -> Result<Segment> {
        Self::create(ctx, prev, next, VecDeque::from([element.to_vec()]))
    }

    /// Read and validate the segment at `address`
    pub fn load(ctx: &BlockContext, address: Address) -> Result<Segment> {
        if address == NULL_ADDRESS {
            return Err(corrupted(address, "null segment handle"));
        }
        let bytes = ctx.allocator.load(address)?;
        Self::decode(address, &bytes).map_err(|e| {
            warn!(address, error = %e, "corrupted list segment");
            e
        })
    }

    fn decode(address: Address, bytes: &[u8]) -> Result<Segment> {
        let mut buf = bytes;
        if buf.remaining() < SEGMENT_HEADER_SIZE {
            return Err(corrupted(address, "region shorter than header"));
        }
        let count = buf.get_u32_le() as usize;
        let data_len = buf.get_u32_le() as usize;
        let prev = buf.get_u64_le();
        let next = buf.get_u64_le();
        if buf.remaining() != data_len {
            return Err(corrupted(address, "data length disagrees with region size"));
        }
        let elements = decode_elements(buf, count).map_err(|reason| corrupted(address, reason))?;
        Ok(Segment {
            address,
            prev,
            next,
            elements,
            data_len,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u32_le(self.elements.len() as u32);
        buf.put_u32_le(self.data_len as u32);
        buf.put_u64_le(self.prev);
        buf.put_u64_le(self.next);
        self.encode_elements(&mut buf);
        buf
    }

    fn encode_elements(&self, buf: &mut Vec<u8>) {
        for element in &self.elements {
            encode_varint(element.len() as u64, buf);
            buf.put_slice(element);
        }
    }

    /// Write the working copy back, resizing the region in place
    pub fn store(&self, ctx: &BlockContext) -> Result<()> {
        let image = self.encode();
        let old = ctx.allocator.size_of(self.address)?;
        if old != image.len() {
            ctx.allocator.resize(self.address, image.len())?;
            if image.len() > old {
                ctx.stats.add_external(image.len() - old);
            } else {
                ctx.stats.sub_external(old - image.len());
            }
        }
        ctx.allocator.write(self.address, 0, &image)
    }

    pub fn free(self, ctx: &BlockContext) -> Result<()> {
        ctx.free_external(self.address)
    }

    /// Next handle of a stored segment, read without decoding it
    pub fn read_next(ctx: &BlockContext, address: Address) -> Result<Address> {
        let mut next = [0u8; 8];
        ctx.allocator.read(address, NEXT_OFFSET, &mut next)?;
        Ok(u64::from_le_bytes(next))
    }

    /// Patch the prev handle of a stored segment
    pub fn write_prev(ctx: &BlockContext, address: Address, prev: Address) -> Result<()> {
        ctx.allocator.write(address, PREV_OFFSET, &prev.to_le_bytes())
    }

    /// Patch the next handle of a stored segment
    pub fn write_next(ctx: &BlockContext, address: Address, next: Address) -> Result<()> {
        ctx.allocator.write(address, NEXT_OFFSET, &next.to_le_bytes())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn prev(&self) -> Address {
        self.prev
    }

    pub fn next(&self) -> Address {
        self.next
    }

    pub fn set_prev(&mut self, prev: Address) {
        self.prev = prev;
    }

    pub fn set_next(&mut self, next: Address) {
        self.next = next;
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Size of the stored region
    pub fn encoded_len(&self) -> usize {
        SEGMENT_HEADER_SIZE + self.data_len
    }

    /// Whether `element` can join without exceeding `max_size`.
    /// An empty segment accepts anything.
    pub fn fits(&self, element: &[u8], max_size: usize) -> bool {
        self.is_empty() || self.encoded_len() + element_len(element) <= max_size
    }

    pub fn element_at(&self, index: usize) -> Option<&[u8]> {
        self.elements.get(index).map(Vec::as_slice)
    }

    pub fn elements(&self) -> impl DoubleEndedIterator<Item = &[u8]> + '_ {
        self.elements.iter().map(Vec::as_slice)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub fn prepend(&mut self, element: &[u8]) {
        self.data_len += element_len(element);
        self.elements.push_front(element.to_vec());
    }

    pub fn append(&mut self, element: &[u8]) {
        self.data_len += element_len(element);
        self.elements.push_back(element.to_vec());
    }

    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let element = self.elements.pop_front()?;
        self.data_len -= element_len(&element);
        Some(element)
    }

    pub fn pop_back(&mut self) -> Option<Vec<u8>> {
        let element = self.elements.pop_back()?;
        self.data_len -= element_len(&element);
        Some(element)
    }

    pub fn insert_at(&mut self, index: usize, element: &[u8]) {
        self.data_len += element_len(element);
        self.elements.insert(index, element.to_vec());
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Vec<u8>> {
        let element = self.elements.remove(index)?;
        self.data_len -= element_len(&element);
        Some(element)
    }

    /// Replace the element at `index`, returning the old one
    pub fn set_at(&mut self, index: usize, element: &[u8]) -> Option<Vec<u8>> {
        let slot = self.elements.get_mut(index)?;
        let old = std::mem::replace(slot, element.to_vec());
        self.data_len = self.data_len - element_len(&old) + element_len(element);
        Some(old)
    }

    /// Insert next to the first occurrence of `pivot`, returning the new
    /// element's index, or `None` when the pivot is not in this segment
    pub fn insert(&mut self, pivot: &[u8], element: &[u8], after: bool) -> Option<usize> {
        let at = self.elements.iter().position(|e| e == pivot)?;
        let index = if after { at + 1 } else { at };
        self.insert_at(index, element);
        Some(index)
    }

    /// Remove up to `limit` occurrences from the front (0 = all)
    pub fn remove_all(&mut self, element: &[u8], limit: usize) -> usize {
        let mut removed = 0;
        let data_len = &mut self.data_len;
        self.elements.retain(|e| {
            if e != element || (limit != 0 && removed >= limit) {
                return true;
            }
            removed += 1;
            *data_len -= element_len(e);
            false
        });
        removed
    }

    /// Remove the last occurrence of `element`
    pub fn remove_reverse(&mut self, element: &[u8]) -> bool {
        match self.elements.iter().rposition(|e| e == element) {
            Some(i) => self.remove_at(i).is_some(),
            None => false,
        }
    }

    /// Append up to `max` elements starting at `offset` to `out`
    pub fn get_range(&self, offset: usize, max: usize, out: &mut Vec<Vec<u8>>) -> usize {
        let before = out.len();
        out.extend(self.elements.iter().skip(offset).take(max).cloned());
        out.len() - before
    }

    pub fn drop_front(&mut self, n: usize) {
        for _ in 0..n.min(self.len()) {
            self.pop_front();
        }
    }

    pub fn drop_back(&mut self, n: usize) {
        for _ in 0..n.min(self.len()) {
            self.pop_back();
        }
    }

    /// Cut the elements into runs that each fit `max_size`. The first run
    /// stays here; the rest are returned in order. Every run keeps at least
    /// one element.
    pub fn split_off_overflow(&mut self, max_size: usize) -> Vec<VecDeque<Vec<u8>>> {
        let mut runs = Vec::new();
        let mut current = VecDeque::new();
        let mut size = SEGMENT_HEADER_SIZE;
        let mut kept = None;
        for element in self.elements.drain(..) {
            let len = element_len(&element);
            if !current.is_empty() && size + len > max_size {
                let run = std::mem::take(&mut current);
                if kept.is_none() {
                    kept = Some(run);
                } else {
                    runs.push(run);
                }
                size = SEGMENT_HEADER_SIZE;
            }
            size += len;
            current.push_back(element);
        }
        match kept {
            Some(run) => {
                runs.push(current);
                self.elements = run;
            }
            None => self.elements = current,
        }
        self.data_len = self.elements.iter().map(|e| element_len(e)).sum();
        runs
    }

    // =========================================================================
    // Snapshot Form
    // =========================================================================

    /// `[count u32][data_len u32][elements]`, without neighbour handles
    pub fn encode_raw(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data_len);
        buf.put_u32_le(self.elements.len() as u32);
        buf.put_u32_le(self.data_len as u32);
        self.encode_elements(&mut buf);
        buf
    }

    /// Parse the output of `encode_raw`
    pub fn decode_raw(raw: &[u8]) -> Result<VecDeque<Vec<u8>>> {
        let mut buf = raw;
        if buf.remaining() < 8 {
            return Err(BasaltError::CorruptedValue("raw segment shorter than header".to_string()));
        }
        let count = buf.get_u32_le() as usize;
        let data_len = buf.get_u32_le() as usize;
        if buf.remaining() != data_len {
            return Err(BasaltError::CorruptedValue(
                "raw segment data length mismatch".to_string(),
            ));
        }
        decode_elements(buf, count)
            .map_err(|reason| BasaltError::CorruptedValue(format!("raw segment: {}", reason)))
    }
}

fn decode_elements(mut data: &[u8], count: usize) -> std::result::Result<VecDeque<Vec<u8>>, &'static str> {
    let mut elements = VecDeque::with_capacity(count.min(data.len()));
    while data.has_remaining() {
        let (len, read) = decode_varint(data).ok_or("bad element length prefix")?;
        data.advance(read);
        let len = usize::try_from(len).map_err(|_| "element length overflow")?;
        if data.remaining() < len {
            return Err("element overruns segment");
        }
        elements.push_back(data[..len].to_vec());
        data.advance(len);
    }
    if elements.len() != count {
        return Err("element count mismatch");
    }
    Ok(elements)
}
