//! Lists Module
//!
//! Redis-style lists stored as a header record plus a doubly linked chain of
//! segments outside the blocks.
//!
//! ## Responsibilities
//! - LPUSH/RPUSH/LPOP/RPOP and the rest of the list command set
//! - Keep the chain and the header consistent under the key's write lock
//! - Snapshot serializer, deserializer and release hooks for `CustomType`
//!
//! ## Layout
//! ```text
//! storage key [TYPE_LIST][len][key] ──► header: count u64 | first | last
//!                                                          │       │
//!            ┌─────────────────────────────────────────────┘       │
//!            ▼                                                     ▼
//!       ┌─────────┐ next ┌─────────┐ next ┌─────────┐        (last segment)
//!  NULL◄│ segment │─────►│ segment │─────►│ segment │─►NULL
//!       │         │◄─────│         │◄─────│         │
//!       └─────────┘ prev └─────────┘ prev └─────────┘
//! ```
//!
//! Segments are never empty and never exceed `list_max_segment_size`
//! unless they hold a single oversized element. A list that loses its last
//! element loses its header record too.
//!
//! Every command takes the key lock (shared for reads, exclusive for
//! writes) before touching the map. Two-key commands lock both keys at once.
//! Blocking pops poll the non-blocking variant until their timeout.

pub mod segment;

use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::block::BlockContext;
use crate::codec::{codec_for, Codec, CodecType};
use crate::error::{BasaltError, Result};
use crate::map::{PutOptions, SortedMap};
use crate::memory::{with_scratch, Address, NULL_ADDRESS};
use crate::types::key::{encode_key_into, encoded_len, TYPE_LIST};

use segment::Segment;

pub const LIST_HEADER_SIZE: usize = 24;

/// Sleep between attempts of a blocking pop
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const CHAIN_SEGMENT: u8 = 1;
const CHAIN_END: u8 = 0;

/// Which end of a list a command works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Left,
    Right,
}

/// Where LINSERT places the new element relative to the pivot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Before,
    After,
}

/// LPOS modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LposOptions {
    /// 1-based match to start from; negative searches from the tail
    pub rank: i64,
    /// Matches to return; `None` returns one, `Some(0)` returns all
    pub count: Option<usize>,
    /// Elements to compare at most; 0 compares the whole list
    pub maxlen: usize,
}

impl Default for LposOptions {
    fn default() -> Self {
        Self {
            rank: 1,
            count: None,
            maxlen: 0,
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Value of a list's record in the map.
///
/// Three little-endian u64 fields, 24 bytes in all. The count is a full u64
/// rather than a 4-byte field, so lengths past `u32::MAX` stay exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHeader {
    pub count: u64,
    pub first: Address,
    pub last: Address,
}

impl ListHeader {
    pub fn encode(&self) -> [u8; LIST_HEADER_SIZE] {
        let mut out = [0u8; LIST_HEADER_SIZE];
        out[..8].copy_from_slice(&self.count.to_le_bytes());
        out[8..16].copy_from_slice(&self.first.to_le_bytes());
        out[16..].copy_from_slice(&self.last.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != LIST_HEADER_SIZE {
            return Err(BasaltError::CorruptedValue(format!(
                "list header of {} bytes",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let header = ListHeader {
            count: buf.get_u64_le(),
            first: buf.get_u64_le(),
            last: buf.get_u64_le(),
        };
        let empty = header.count == 0;
        if empty != (header.first == NULL_ADDRESS) || empty != (header.last == NULL_ADDRESS) {
            return Err(BasaltError::CorruptedValue(
                "list header count disagrees with its segment handles".to_string(),
            ));
        }
        Ok(header)
    }
}

#[derive(Debug, Default)]
struct ListRecord {
    header: ListHeader,
    expire: Option<u64>,
}

// ============================================================================
// Chain Walking
// ============================================================================

/// Walk over a chain in one direction. Every segment holds at least one
/// element, so a chain with more segments than elements is corrupt.
struct Walk<'c> {
    ctx: &'c BlockContext,
    next: Address,
    forward: bool,
    budget: u64,
}

impl<'c> Walk<'c> {
    fn forward(ctx: &'c BlockContext, header: &ListHeader) -> Self {
        Self {
            ctx,
            next: header.first,
            forward: true,
            budget: header.count,
        }
    }

    fn backward(ctx: &'c BlockContext, header: &ListHeader) -> Self {
        Self {
            ctx,
            next: header.last,
            forward: false,
            budget: header.count,
        }
    }

    fn next_segment(&mut self) -> Result<Option<Segment>> {
        if self.next == NULL_ADDRESS {
            return Ok(None);
        }
        if self.budget == 0 {
            return Err(BasaltError::CorruptedValue(
                "segment chain longer than its element count".to_string(),
            ));
        }
        let segment = Segment::load(self.ctx, self.next)?;
        if segment.is_empty() {
            return Err(BasaltError::CorruptedValue(format!(
                "empty segment {} in chain",
                segment.address()
            )));
        }
        self.budget = self.budget.saturating_sub(segment.len() as u64);
        self.next = if self.forward {
            segment.next()
        } else {
            segment.prev()
        };
        Ok(Some(segment))
    }
}

fn chain_too_short() -> BasaltError {
    BasaltError::CorruptedValue("segment chain shorter than its element count".to_string())
}

/// Free every segment of a chain
fn free_chain(ctx: &BlockContext, header: &ListHeader) -> Result<()> {
    let mut address = header.first;
    let mut budget = header.count;
    while address != NULL_ADDRESS {
        if budget == 0 {
            return Err(BasaltError::CorruptedValue(
                "segment chain longer than its element count".to_string(),
            ));
        }
        budget -= 1;
        let next = Segment::read_next(ctx, address)?;
        ctx.free_external(address)?;
        address = next;
    }
    Ok(())
}

fn with_list_key<R>(key: &[u8], f: impl FnOnce(&[u8]) -> R) -> R {
    with_scratch(encoded_len(key, &[]), |buf| {
        encode_key_into(buf, TYPE_LIST, key, &[]);
        f(buf)
    })
}

/// Redis index (negative counts from the tail) to an absolute position
fn resolve_index(index: i64, len: u64) -> Option<u64> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as u64)
}

/// Redis `start stop` pair to an inclusive absolute range, `None` if empty
fn resolve_range(start: i64, stop: i64, len: u64) -> Option<(u64, u64)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { start.saturating_add(len) } else { start }.max(0);
    let stop = if stop < 0 { stop.saturating_add(len) } else { stop }.min(len - 1);
    if start > stop || start >= len {
        return None;
    }
    Some((start as u64, stop as u64))
}

fn poll<T>(timeout: Duration, mut attempt: impl FnMut() -> Result<Option<T>>) -> Result<Option<T>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

// ============================================================================
// Commands
// ============================================================================

/// List commands over a sorted map
#[derive(Debug, Clone, Copy)]
pub struct Lists<'a> {
    map: &'a SortedMap,
}

impl<'a> Lists<'a> {
    pub fn new(map: &'a SortedMap) -> Self {
        Self { map }
    }

    fn ctx(&self) -> &BlockContext {
        self.map.context()
    }

    fn max_segment(&self) -> usize {
        self.map.config().list_max_segment_size
    }

    fn read(&self, skey: &[u8]) -> Result<Option<ListRecord>> {
        match self.map.get_entry(skey)? {
            None => Ok(None),
            Some(entry) if !entry.custom => Err(BasaltError::WrongType),
            Some(entry) => Ok(Some(ListRecord {
                header: ListHeader::decode(&entry.value)?,
                expire: entry.expire,
            })),
        }
    }

    fn write(&self, skey: &[u8], record: &ListRecord) -> Result<()> {
        if record.header.count == 0 {
            self.map.remove_record(skey, false)?;
            return Ok(());
        }
        let options = PutOptions {
            expire: record.expire,
            custom: true,
        };
        if !self.map.put_with_options(skey, &record.header.encode(), options)? {
            return Err(BasaltError::OutOfMemory {
                requested: LIST_HEADER_SIZE,
                limit: self.ctx().stats.limit(),
            });
        }
        Ok(())
    }

    /// Persist the header whatever `outcome` was, then report the first error
    fn commit<T>(&self, skey: &[u8], record: &ListRecord, outcome: Result<T>) -> Result<T> {
        let written = self.write(skey, record);
        let value = outcome?;
        written?;
        Ok(value)
    }

    // =========================================================================
    // Chain Primitives
    // =========================================================================

    fn push(&self, header: &mut ListHeader, end: ListEnd, element: &[u8]) -> Result<()> {
        let ctx = self.ctx();
        let max = self.max_segment();
        match end {
            ListEnd::Left => {
                if header.first != NULL_ADDRESS {
                    let mut segment = Segment::load(ctx, header.first)?;
                    if segment.fits(element, max) {
                        segment.prepend(element);
                        segment.store(ctx)?;
                        header.count += 1;
                        return Ok(());
                    }
                }
                let segment = Segment::with_element(ctx, NULL_ADDRESS, header.first, element)?;
                if header.first == NULL_ADDRESS {
                    header.last = segment.address();
                } else {
                    Segment::write_prev(ctx, header.first, segment.address())?;
                }
                header.first = segment.address();
            }
            ListEnd::Right => {
                if header.last != NULL_ADDRESS {
                    let mut segment = Segment::load(ctx, header.last)?;
                    if segment.fits(element, max) {
                        segment.append(element);
                        segment.store(ctx)?;
                        header.count += 1;
                        return Ok(());
                    }
                }
                let segment = Segment::with_element(ctx, header.last, NULL_ADDRESS, element)?;
                if header.last == NULL_ADDRESS {
                    header.first = segment.address();
                } else {
                    Segment::write_next(ctx, header.last, segment.address())?;
                }
                header.last = segment.address();
            }
        }
        header.count += 1;
        Ok(())
    }

    fn pop(&self, header: &mut ListHeader, end: ListEnd) -> Result<Option<Vec<u8>>> {
        let address = match end {
            ListEnd::Left => header.first,
            ListEnd::Right => header.last,
        };
        if address == NULL_ADDRESS {
            return Ok(None);
        }
        let mut segment = Segment::load(self.ctx(), address)?;
        let element = match end {
            ListEnd::Left => segment.pop_front(),
            ListEnd::Right => segment.pop_back(),
        }
        .ok_or_else(|| BasaltError::CorruptedValue(format!("empty segment {} in chain", address)))?;
        header.count -= 1;
        if segment.is_empty() {
            self.unlink(header, segment)?;
        } else {
            segment.store(self.ctx())?;
        }
        Ok(Some(element))
    }

    /// Take back the last `n` pushes at `end`, restoring the header
    fn unpush(&self, header: &mut ListHeader, end: ListEnd, n: usize) -> Result<()> {
        for _ in 0..n {
            self.pop(header, end)?;
        }
        Ok(())
    }

    /// Element at one end, without removing it
    fn peek(&self, header: &ListHeader, end: ListEnd) -> Result<Option<Vec<u8>>> {
        let address = match end {
            ListEnd::Left => header.first,
            ListEnd::Right => header.last,
        };
        if address == NULL_ADDRESS {
            return Ok(None);
        }
        let segment = Segment::load(self.ctx(), address)?;
        let mut elements = segment.elements();
        let element = match end {
            ListEnd::Left => elements.next(),
            ListEnd::Right => elements.next_back(),
        };
        element
            .map(|element| Some(element.to_vec()))
            .ok_or_else(|| BasaltError::CorruptedValue(format!("empty segment {} in chain", address)))
    }

    fn pop_into(
        &self,
        header: &mut ListHeader,
        end: ListEnd,
        count: usize,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        while out.len() < count {
            match self.pop(header, end)? {
                Some(element) => out.push(element),
                None => break,
            }
        }
        Ok(())
    }

    /// Detach an emptied segment from its neighbours and free it
    fn unlink(&self, header: &mut ListHeader, segment: Segment) -> Result<()> {
        let ctx = self.ctx();
        if segment.prev() == NULL_ADDRESS {
            header.first = segment.next();
        } else {
            Segment::write_next(ctx, segment.prev(), segment.next())?;
        }
        if segment.next() == NULL_ADDRESS {
            header.last = segment.prev();
        } else {
            Segment::write_prev(ctx, segment.next(), segment.prev())?;
        }
        segment.free(ctx)
    }

    /// Store a segment that may have outgrown the size limit, splitting its
    /// tail into new segments linked right after it
    fn store_balanced(&self, header: &mut ListHeader, mut segment: Segment) -> Result<()> {
        let ctx = self.ctx();
        let max = self.max_segment();
        if segment.encoded_len() <= max || segment.len() <= 1 {
            return segment.store(ctx);
        }
        let runs = segment.split_off_overflow(max);
        let old_next = segment.next();
        let mut created: Vec<Segment> = Vec::with_capacity(runs.len());
        let linked = runs
            .into_iter()
            .try_for_each(|run| -> Result<()> {
                let prev = created.last().map_or(segment.address(), Segment::address);
                created.push(Segment::create(ctx, prev, NULL_ADDRESS, run)?);
                Ok(())
            })
            .and_then(|()| {
                for pair in created.windows(2) {
                    Segment::write_next(ctx, pair[0].address(), pair[1].address())?;
                }
                let tail = created.last().map_or(segment.address(), Segment::address);
                Segment::write_next(ctx, tail, old_next)?;
                segment.set_next(created.first().map_or(old_next, Segment::address));
                segment.store(ctx)
            });
        // the new segments are unreachable until the old one is stored
        if let Err(e) = linked {
            for new in created {
                new.free(ctx)?;
            }
            return Err(e);
        }
        let tail = created.last().map_or(segment.address(), Segment::address);
        if old_next == NULL_ADDRESS {
            header.last = tail;
        } else {
            Segment::write_prev(ctx, old_next, tail)?;
        }
        debug!(
            segment = segment.address(),
            new_segments = created.len(),
            "list segment split"
        );
        Ok(())
    }

    /// Segment holding list position `index` and the offset inside it
    fn seek(&self, header: &ListHeader, index: u64) -> Result<(Segment, usize)> {
        if index >= header.count {
            return Err(BasaltError::IndexOutOfRange);
        }
        if index < header.count / 2 {
            let mut walk = Walk::forward(self.ctx(), header);
            let mut start = 0u64;
            while let Some(segment) = walk.next_segment()? {
                let len = segment.len() as u64;
                if index < start + len {
                    return Ok((segment, (index - start) as usize));
                }
                start += len;
            }
        } else {
            let mut walk = Walk::backward(self.ctx(), header);
            let mut end = header.count;
            while let Some(segment) = walk.next_segment()? {
                let start = end.checked_sub(segment.len() as u64).ok_or_else(chain_too_short)?;
                if index >= start {
                    return Ok((segment, (index - start) as usize));
                }
                end = start;
            }
        }
        Err(chain_too_short())
    }

    /// Remove `n` elements from one end
    fn trim_end(&self, header: &mut ListHeader, end: ListEnd, mut n: u64) -> Result<()> {
        let ctx = self.ctx();
        while n > 0 {
            let address = match end {
                ListEnd::Left => header.first,
                ListEnd::Right => header.last,
            };
            if address == NULL_ADDRESS {
                return Err(chain_too_short());
            }
            let mut segment = Segment::load(ctx, address)?;
            let len = segment.len() as u64;
            if len <= n {
                n -= len;
                header.count -= len;
                self.unlink(header, segment)?;
            } else {
                match end {
                    ListEnd::Left => segment.drop_front(n as usize),
                    ListEnd::Right => segment.drop_back(n as usize),
                }
                header.count -= n;
                segment.store(ctx)?;
                n = 0;
            }
        }
        Ok(())
    }

    fn remove_matches(&self, header: &mut ListHeader, count: i64, element: &[u8]) -> Result<u64> {
        let ctx = self.ctx();
        let limit = count.unsigned_abs();
        let mut removed = 0u64;
        if count >= 0 {
            let mut walk = Walk::forward(ctx, header);
            while limit == 0 || removed < limit {
                let Some(mut segment) = walk.next_segment()? else {
                    break;
                };
                let budget = if limit == 0 { 0 } else { (limit - removed) as usize };
                let n = segment.remove_all(element, budget) as u64;
                if n > 0 {
                    removed += n;
                    header.count -= n;
                    if segment.is_empty() {
                        self.unlink(header, segment)?;
                    } else {
                        segment.store(ctx)?;
                    }
                }
            }
        } else {
            let mut walk = Walk::backward(ctx, header);
            while removed < limit {
                let Some(mut segment) = walk.next_segment()? else {
                    break;
                };
                let mut n = 0u64;
                while removed + n < limit && segment.remove_reverse(element) {
                    n += 1;
                }
                if n > 0 {
                    removed += n;
                    header.count -= n;
                    if segment.is_empty() {
                        self.unlink(header, segment)?;
                    } else {
                        segment.store(ctx)?;
                    }
                }
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Push / Pop
    // =========================================================================

    /// Push each element to the head in turn, returning the new length
    pub fn lpush(&self, key: &[u8], elements: &[&[u8]]) -> Result<u64> {
        self.push_many(key, ListEnd::Left, elements, false)
    }

    /// LPUSH only when the list already exists
    pub fn lpushx(&self, key: &[u8], elements: &[&[u8]]) -> Result<u64> {
        self.push_many(key, ListEnd::Left, elements, true)
    }

    pub fn rpush(&self, key: &[u8], elements: &[&[u8]]) -> Result<u64> {
        self.push_many(key, ListEnd::Right, elements, false)
    }

    pub fn rpushx(&self, key: &[u8], elements: &[&[u8]]) -> Result<u64> {
        self.push_many(key, ListEnd::Right, elements, true)
    }

    fn push_many(&self, key: &[u8], end: ListEnd, elements: &[&[u8]], only_existing: bool) -> Result<u64> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let mut record = match self.read(skey)? {
                Some(record) => record,
                None if only_existing => return Ok(0),
                None => ListRecord::default(),
            };
            if elements.is_empty() {
                return Ok(record.header.count);
            }
            let mut pushed = 0;
            let outcome = elements.iter().try_for_each(|element| -> Result<()> {
                self.push(&mut record.header, end, element)?;
                pushed += 1;
                Ok(())
            });
            // all or nothing: a refused element or header write takes back every push
            if let Err(e) = outcome.and_then(|()| self.write(skey, &record)) {
                self.unpush(&mut record.header, end, pushed)?;
                return Err(e);
            }
            Ok(record.header.count)
        })
    }

    pub fn lpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.pop_count(key, ListEnd::Left, 1)?.pop())
    }

    pub fn rpop(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.pop_count(key, ListEnd::Right, 1)?.pop())
    }

    /// Pop up to `count` elements from the head
    pub fn lpop_count(&self, key: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        self.pop_count(key, ListEnd::Left, count)
    }

    pub fn rpop_count(&self, key: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
        self.pop_count(key, ListEnd::Right, count)
    }

    fn pop_count(&self, key: &[u8], end: ListEnd, count: usize) -> Result<Vec<Vec<u8>>> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let Some(mut record) = self.read(skey)? else {
                return Ok(Vec::new());
            };
            let mut out = Vec::with_capacity(count.min(record.header.count as usize));
            let outcome = self.pop_into(&mut record.header, end, count, &mut out);
            self.commit(skey, &record, outcome)?;
            Ok(out)
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn llen(&self, key: &[u8]) -> Result<u64> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().read_lock(skey);
            Ok(self.read(skey)?.map_or(0, |record| record.header.count))
        })
    }

    pub fn lindex(&self, key: &[u8], index: i64) -> Result<Option<Vec<u8>>> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().read_lock(skey);
            let Some(record) = self.read(skey)? else {
                return Ok(None);
            };
            let Some(index) = resolve_index(index, record.header.count) else {
                return Ok(None);
            };
            let (segment, offset) = self.seek(&record.header, index)?;
            Ok(segment.element_at(offset).map(<[u8]>::to_vec))
        })
    }

    /// Elements `start..=stop`; negative positions count from the tail
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().read_lock(skey);
            let Some(record) = self.read(skey)? else {
                return Ok(Vec::new());
            };
            let Some((start, stop)) = resolve_range(start, stop, record.header.count) else {
                return Ok(Vec::new());
            };
            let wanted = (stop - start + 1) as usize;
            let mut out = Vec::with_capacity(wanted);
            let (segment, offset) = self.seek(&record.header, start)?;
            segment.get_range(offset, wanted, &mut out);
            let mut address = segment.next();
            while out.len() < wanted {
                if address == NULL_ADDRESS {
                    return Err(chain_too_short());
                }
                let segment = Segment::load(self.ctx(), address)?;
                segment.get_range(0, wanted - out.len(), &mut out);
                address = segment.next();
            }
            Ok(out)
        })
    }

    /// Positions of `element`, following LPOS's RANK, COUNT and MAXLEN
    pub fn lpos(&self, key: &[u8], element: &[u8], options: LposOptions) -> Result<Vec<u64>> {
        if options.rank == 0 {
            return Err(BasaltError::InvalidValue(
                "RANK can't be zero: use 1 to start from the first match".to_string(),
            ));
        }
        with_list_key(key, |skey| {
            let _guard = self.map.locker().read_lock(skey);
            let Some(record) = self.read(skey)? else {
                return Ok(Vec::new());
            };
            let header = record.header;
            let mut skip = options.rank.unsigned_abs() - 1;
            let wanted = match options.count {
                None => 1,
                Some(0) => usize::MAX,
                Some(n) => n,
            };
            let maxlen = match options.maxlen {
                0 => u64::MAX,
                n => n as u64,
            };
            let mut found = Vec::new();
            let mut scanned = 0u64;
            let forward = options.rank > 0;
            let mut walk = if forward {
                Walk::forward(self.ctx(), &header)
            } else {
                Walk::backward(self.ctx(), &header)
            };
            // forward: index of the next element; backward: one past it
            let mut position = if forward { 0 } else { header.count };
            'walk: while let Some(segment) = walk.next_segment()? {
                let mut elements: Vec<&[u8]> = segment.elements().collect();
                if !forward {
                    elements.reverse();
                }
                for candidate in elements {
                    if scanned >= maxlen {
                        break 'walk;
                    }
                    scanned += 1;
                    let index = if forward {
                        position += 1;
                        position - 1
                    } else {
                        position -= 1;
                        position
                    };
                    if candidate != element {
                        continue;
                    }
                    if skip > 0 {
                        skip -= 1;
                        continue;
                    }
                    found.push(index);
                    if found.len() >= wanted {
                        break 'walk;
                    }
                }
            }
            Ok(found)
        })
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Insert next to the first `pivot`. Returns the new length, -1 when the
    /// pivot is missing and 0 when the list does not exist.
    pub fn linsert(&self, key: &[u8], position: InsertPosition, pivot: &[u8], element: &[u8]) -> Result<i64> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let Some(mut record) = self.read(skey)? else {
                return Ok(0);
            };
            let after = position == InsertPosition::After;
            let mut walk = Walk::forward(self.ctx(), &record.header);
            while let Some(mut segment) = walk.next_segment()? {
                if segment.insert(pivot, element, after).is_some() {
                    record.header.count += 1;
                    let outcome = self.store_balanced(&mut record.header, segment);
                    if outcome.is_err() {
                        record.header.count -= 1;
                    }
                    self.commit(skey, &record, outcome)?;
                    return Ok(record.header.count as i64);
                }
            }
            Ok(-1)
        })
    }

    /// Remove occurrences of `element`: `count > 0` from the head, `count < 0`
    /// from the tail, `count == 0` all of them
    pub fn lrem(&self, key: &[u8], count: i64, element: &[u8]) -> Result<u64> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let Some(mut record) = self.read(skey)? else {
                return Ok(0);
            };
            let outcome = self.remove_matches(&mut record.header, count, element);
            self.commit(skey, &record, outcome)
        })
    }

    pub fn lset(&self, key: &[u8], index: i64, element: &[u8]) -> Result<()> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let mut record = self.read(skey)?.ok_or(BasaltError::KeyNotFound)?;
            let index = resolve_index(index, record.header.count).ok_or(BasaltError::IndexOutOfRange)?;
            let (mut segment, offset) = self.seek(&record.header, index)?;
            segment.set_at(offset, element);
            let outcome = self.store_balanced(&mut record.header, segment);
            self.commit(skey, &record, outcome)
        })
    }

    /// Keep only `start..=stop`; an empty range deletes the list
    pub fn ltrim(&self, key: &[u8], start: i64, stop: i64) -> Result<()> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let Some(mut record) = self.read(skey)? else {
                return Ok(());
            };
            let len = record.header.count;
            let outcome = match resolve_range(start, stop, len) {
                Some((start, stop)) => self
                    .trim_end(&mut record.header, ListEnd::Left, start)
                    .and_then(|()| self.trim_end(&mut record.header, ListEnd::Right, len - 1 - stop)),
                None => self.trim_end(&mut record.header, ListEnd::Left, len),
            };
            self.commit(skey, &record, outcome)
        })
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// Pop from one end of `source` and push onto one end of `destination`
    pub fn lmove(&self, source: &[u8], destination: &[u8], from: ListEnd, to: ListEnd) -> Result<Option<Vec<u8>>> {
        with_list_key(source, |src| {
            with_list_key(destination, |dst| {
                let _guard = self.map.locker().write_lock_all(&[src, dst]);
                let Some(mut source) = self.read(src)? else {
                    return Ok(None);
                };
                let Some(element) = self.peek(&source.header, from)? else {
                    return Ok(None);
                };
                // the element lands before it leaves, so a refused push or
                // destination write changes neither list
                if src == dst {
                    self.push(&mut source.header, to, &element)?;
                    let outcome = self.pop(&mut source.header, from);
                    self.commit(src, &source, outcome)?;
                    return Ok(Some(element));
                }
                let mut target = self.read(dst)?.unwrap_or_default();
                self.push(&mut target.header, to, &element)?;
                if let Err(e) = self.write(dst, &target) {
                    self.unpush(&mut target.header, to, 1)?;
                    return Err(e);
                }
                let outcome = self.pop(&mut source.header, from);
                self.commit(src, &source, outcome)?;
                Ok(Some(element))
            })
        })
    }

    pub fn rpoplpush(&self, source: &[u8], destination: &[u8]) -> Result<Option<Vec<u8>>> {
        self.lmove(source, destination, ListEnd::Right, ListEnd::Left)
    }

    // =========================================================================
    // Blocking Variants
    // =========================================================================

    /// Pop the head of the first non-empty list, polling until `timeout`.
    /// A zero timeout makes a single attempt.
    pub fn blpop(&self, keys: &[&[u8]], timeout: Duration) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.blocking_pop(keys, ListEnd::Left, timeout)
    }

    pub fn brpop(&self, keys: &[&[u8]], timeout: Duration) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.blocking_pop(keys, ListEnd::Right, timeout)
    }

    fn blocking_pop(&self, keys: &[&[u8]], end: ListEnd, timeout: Duration) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        poll(timeout, || {
            for key in keys {
                if let Some(element) = self.pop_count(key, end, 1)?.pop() {
                    return Ok(Some((key.to_vec(), element)));
                }
            }
            Ok(None)
        })
    }

    pub fn blmove(
        &self,
        source: &[u8],
        destination: &[u8],
        from: ListEnd,
        to: ListEnd,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        poll(timeout, || self.lmove(source, destination, from, to))
    }

    // =========================================================================
    // Whole List
    // =========================================================================

    /// Remove the list and free its segments
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().write_lock(skey);
            let Some(record) = self.read(skey)? else {
                return Ok(false);
            };
            free_chain(self.ctx(), &record.header)?;
            self.map.remove_record(skey, false)?;
            Ok(true)
        })
    }

    /// Walk the chain both ways and check it against the header, returning
    /// the number of elements visited
    pub fn check_integrity(&self, key: &[u8]) -> Result<u64> {
        with_list_key(key, |skey| {
            let _guard = self.map.locker().read_lock(skey);
            let Some(record) = self.read(skey)? else {
                return Ok(0);
            };
            let header = record.header;
            let corrupt = |reason: &str| Err(BasaltError::CorruptedValue(reason.to_string()));

            let mut forward_segments = Vec::new();
            let mut forward_elements = Vec::new();
            let mut previous = NULL_ADDRESS;
            let mut walk = Walk::forward(self.ctx(), &header);
            while let Some(segment) = walk.next_segment()? {
                if segment.prev() != previous {
                    return corrupt("prev handle does not point at the preceding segment");
                }
                if segment.encoded_len() > self.max_segment() && segment.len() > 1 {
                    return corrupt("segment over the size limit");
                }
                previous = segment.address();
                forward_segments.push(segment.address());
                forward_elements.extend(segment.elements().map(<[u8]>::to_vec));
            }
            if previous != header.last {
                return corrupt("last handle does not match the chain's tail");
            }
            if forward_elements.len() as u64 != header.count {
                return corrupt("chain length disagrees with the header count");
            }

            let mut backward_segments = Vec::new();
            let mut backward_elements = Vec::new();
            let mut walk = Walk::backward(self.ctx(), &header);
            while let Some(segment) = walk.next_segment()? {
                backward_segments.push(segment.address());
                backward_elements.extend(segment.elements().rev().map(<[u8]>::to_vec));
            }
            backward_segments.reverse();
            backward_elements.reverse();
            if backward_segments != forward_segments || backward_elements != forward_elements {
                return corrupt("backward walk disagrees with forward walk");
            }
            Ok(header.count)
        })
    }
}

// ============================================================================
// Composite Hooks
// ============================================================================

/// `[codec u8][count u64]` then `[1][raw_len u32][stored_len u32][stored]`
/// per segment, closed by `[0]`
pub(crate) fn serialize(ctx: &BlockContext, value: &[u8]) -> Result<Vec<u8>> {
    let header = ListHeader::decode(value)?;
    let codec = ctx.codec.as_ref();
    let mut out = Vec::new();
    out.put_u8(codec.codec_type().as_u8());
    out.put_u64_le(header.count);
    let mut walk = Walk::forward(ctx, &header);
    let mut seen = 0u64;
    while let Some(segment) = walk.next_segment()? {
        seen += segment.len() as u64;
        let raw = segment.encode_raw();
        let stored = codec.compress(&raw)?;
        out.put_u8(CHAIN_SEGMENT);
        out.put_u32_le(raw.len() as u32);
        out.put_u32_le(stored.len() as u32);
        out.put_slice(&stored);
    }
    if seen != header.count {
        return Err(chain_too_short());
    }
    out.put_u8(CHAIN_END);
    Ok(out)
}

/// Rebuild a chain from `serialize` output, returning its header value
pub(crate) fn deserialize(ctx: &BlockContext, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = payload;
    if buf.remaining() < 1 + 8 {
        return Err(BasaltError::SnapshotCorruption("truncated list payload".to_string()));
    }
    let codec = codec_for(CodecType::try_from(buf.get_u8())?);
    let count = buf.get_u64_le();
    let mut header = ListHeader::default();
    let outcome = rebuild_chain(ctx, &mut buf, codec.as_ref(), &mut header).and_then(|()| {
        if header.count != count {
            return Err(BasaltError::SnapshotCorruption(format!(
                "list payload holds {} elements, expected {}",
                header.count, count
            )));
        }
        Ok(())
    });
    if let Err(e) = outcome {
        let _ = free_chain(ctx, &header);
        return Err(e);
    }
    Ok(header.encode().to_vec())
}

fn rebuild_chain(ctx: &BlockContext, buf: &mut &[u8], codec: &dyn Codec, header: &mut ListHeader) -> Result<()> {
    let truncated = || BasaltError::SnapshotCorruption("truncated list payload".to_string());
    loop {
        if !buf.has_remaining() {
            return Err(truncated());
        }
        match buf.get_u8() {
            CHAIN_END => break,
            CHAIN_SEGMENT => {}
            other => {
                return Err(BasaltError::SnapshotCorruption(format!(
                    "unknown list chain marker {:#x}",
                    other
                )))
            }
        }
        if buf.remaining() < 8 {
            return Err(truncated());
        }
        let raw_len = buf.get_u32_le() as usize;
        let stored_len = buf.get_u32_le() as usize;
        if buf.remaining() < stored_len {
            return Err(truncated());
        }
        let raw = codec.decompress(&buf[..stored_len], raw_len)?;
        buf.advance(stored_len);
        let elements: VecDeque<Vec<u8>> = Segment::decode_raw(&raw)?;
        if elements.is_empty() {
            return Err(BasaltError::SnapshotCorruption("empty list segment".to_string()));
        }
        let len = elements.len() as u64;
        let segment = Segment::create(ctx, header.last, NULL_ADDRESS, elements)?;
        if header.last == NULL_ADDRESS {
            header.first = segment.address();
        } else {
            Segment::write_next(ctx, header.last, segment.address())?;
        }
        header.last = segment.address();
        header.count += len;
    }
    if buf.has_remaining() {
        return Err(BasaltError::SnapshotCorruption("trailing bytes after list chain".to_string()));
    }
    Ok(())
}

/// Free the chain behind a list header value
pub(crate) fn release(ctx: &BlockContext, value: &[u8]) -> Result<()> {
    free_chain(ctx, &ListHeader::decode(value)?)
}
