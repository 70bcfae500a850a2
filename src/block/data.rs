//! Data Block
//!
//! A sorted record region that grows through power-of-two size classes up to
//! `max_block_size`. When a codec is configured the region is compressed
//! after every mutation and decompressed on demand.
//!
//! ```text
//! Plain:       [ rec | rec | rec | ... | free ]   capacity = size class
//! Compressed:  [ codec image ]                    raw_len, capacity kept
//! ```

use std::borrow::Cow;
use std::ops::Bound;

use tracing::{debug, warn};

use super::page::{RecordPage, Slot};
use super::record::{build_record, rebuild_record, release_record, rewrite_is_free, Placement, RecordRef};
use super::scanner::DataBlockScanner;
use super::{BlockContext, Entry, PutStatus, RecordOptions};
use crate::codec::CodecType;
use crate::config::MIN_BLOCK_SIZE;
use crate::error::{BasaltError, Result};
use crate::types::CustomType;

#[derive(Debug)]
enum BlockState {
    Plain(RecordPage),
    Compressed {
        image: Vec<u8>,
        raw_len: usize,
        capacity: usize,
        count: usize,
    },
}

/// Sorted container of key-value records
#[derive(Debug)]
pub struct DataBlock {
    state: BlockState,
    /// Id of the owning index block
    parent: u64,
    /// First record is the map-wide empty-key sentinel
    sentinel: bool,
}

/// Smallest size class holding `needed` bytes, or None above `max`
fn size_class(needed: usize, max: usize) -> Option<usize> {
    if needed > max {
        return None;
    }
    let mut class = MIN_BLOCK_SIZE.min(max);
    while class < needed {
        class *= 2;
    }
    Some(class.min(max))
}

impl DataBlock {
    /// Create an empty block at the smallest size class
    pub fn new(ctx: &BlockContext, parent: u64) -> Result<Self> {
        let capacity = MIN_BLOCK_SIZE.min(ctx.config.max_block_size);
        ctx.stats.reserve(capacity)?;
        Ok(Self {
            state: BlockState::Plain(RecordPage::new(capacity)),
            parent,
            sentinel: false,
        })
    }

    /// Create the map's first block, holding only the empty-key sentinel
    pub fn with_sentinel(ctx: &BlockContext, parent: u64) -> Result<Self> {
        let mut block = Self::new(ctx, parent)?;
        block.put(ctx, b"", b"", &RecordOptions::default())?;
        block.sentinel = true;
        Ok(block)
    }

    /// Build a block around already-encoded records
    pub fn from_packed(ctx: &BlockContext, parent: u64, bytes: &[u8]) -> Result<Self> {
        let capacity = size_class(bytes.len(), ctx.config.max_block_size).ok_or_else(|| {
            BasaltError::Internal(format!("{} packed bytes exceed block size", bytes.len()))
        })?;
        ctx.stats.reserve(capacity)?;
        ctx.stats.adjust_data(0, bytes.len());
        let sentinel = !bytes.is_empty() && RecordRef::new(bytes).is_empty_key();
        Ok(Self {
            state: BlockState::Plain(RecordPage::from_bytes(bytes, capacity)),
            parent,
            sentinel,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn parent(&self) -> u64 {
        self.parent
    }

    pub fn set_parent(&mut self, parent: u64) {
        self.parent = parent;
    }

    /// Number of records, sentinel included
    pub fn len(&self) -> usize {
        match &self.state {
            BlockState::Plain(page) => page.len(),
            BlockState::Compressed { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records, sentinel excluded
    pub fn record_count(&self) -> usize {
        self.len() - usize::from(self.sentinel)
    }

    pub fn has_sentinel(&self) -> bool {
        self.sentinel
    }

    /// Uncompressed bytes used by records
    pub fn data_size(&self) -> usize {
        match &self.state {
            BlockState::Plain(page) => page.used(),
            BlockState::Compressed { raw_len, .. } => *raw_len,
        }
    }

    /// Size class of the record region
    pub fn capacity(&self) -> usize {
        match &self.state {
            BlockState::Plain(page) => page.capacity(),
            BlockState::Compressed { capacity, .. } => *capacity,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.state, BlockState::Compressed { .. })
    }

    /// Bytes of the compressed image, if compressed
    pub fn compressed_size(&self) -> Option<usize> {
        match &self.state {
            BlockState::Plain(_) => None,
            BlockState::Compressed { image, .. } => Some(image.len()),
        }
    }

    // =========================================================================
    // Page Access
    // =========================================================================

    /// Readable page, decompressed into a temporary if needed
    fn page(&self, ctx: &BlockContext) -> Result<Cow<'_, RecordPage>> {
        match &self.state {
            BlockState::Plain(page) => Ok(Cow::Borrowed(page)),
            BlockState::Compressed {
                image,
                raw_len,
                capacity,
                ..
            } => {
                let raw = ctx.codec.decompress(image, *raw_len)?;
                Ok(Cow::Owned(RecordPage::from_bytes(&raw, *capacity)))
            }
        }
    }

    /// Plain page for mutation. With `admit` the decompressed region is
    /// charged past the memory ceiling.
    fn plain_mut(&mut self, ctx: &BlockContext, admit: bool) -> Result<&mut RecordPage> {
        self.decompress(ctx, admit)?;
        match &mut self.state {
            BlockState::Plain(page) => Ok(page),
            BlockState::Compressed { .. } => {
                Err(BasaltError::Internal("block still compressed".to_string()))
            }
        }
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&self, ctx: &BlockContext, key: &[u8]) -> Result<Option<Entry>> {
        let alloc = ctx.allocator.as_ref();
        let page = self.page(ctx)?;
        match page.search(alloc, key)? {
            Slot::Found(i) => Ok(Some(page.record(i).to_entry(alloc)?)),
            Slot::Vacant(_) => Ok(None),
        }
    }

    pub fn contains(&self, ctx: &BlockContext, key: &[u8]) -> Result<bool> {
        let page = self.page(ctx)?;
        Ok(matches!(
            page.search(ctx.allocator.as_ref(), key)?,
            Slot::Found(_)
        ))
    }

    pub fn first_key(&self, ctx: &BlockContext) -> Result<Option<Vec<u8>>> {
        let page = self.page(ctx)?;
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.record(0).key(ctx.allocator.as_ref())?.into_owned()))
    }

    pub fn last_key(&self, ctx: &BlockContext) -> Result<Option<Vec<u8>>> {
        let page = self.page(ctx)?;
        if page.is_empty() {
            return Ok(None);
        }
        let last = page.len() - 1;
        Ok(Some(page.record(last).key(ctx.allocator.as_ref())?.into_owned()))
    }

    /// Insert or overwrite a record.
    ///
    /// Returns `Full` without touching the block when the record does not fit
    /// even at the largest size class.
    pub fn put(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        value: &[u8],
        opts: &RecordOptions,
    ) -> Result<PutStatus> {
        let alloc = ctx.allocator.as_ref();
        let placement = Placement::for_record(
            key.len(),
            value.len(),
            opts.expire.is_some(),
            ctx.external_threshold(),
        );
        let new_len = placement.encoded_len(key.len(), value.len(), opts.expire.is_some());
        let max = ctx.config.max_block_size;

        let admit = self.is_compressed()
            && self.rewrites_for_free(ctx, key, value.len(), placement, new_len)?;
        let page = self.plain_mut(ctx, admit)?;
        let before = page.used();
        let slot = page.search(alloc, key)?;
        let old_len = match slot {
            Slot::Found(i) => page.record(i).len(),
            Slot::Vacant(_) => 0,
        };
        let needed = page.used() - old_len + new_len;
        let capacity = page.capacity();
        if needed > capacity {
            match size_class(needed, max) {
                Some(class) => {
                    if let Err(e) = ctx.stats.reserve(class - capacity) {
                        self.compress_if_needed(ctx)?;
                        return Err(e);
                    }
                    page.resize_capacity(class);
                }
                None => {
                    self.compress_if_needed(ctx)?;
                    return Ok(PutStatus::Full);
                }
            }
        }

        let built = match slot {
            Slot::Found(i) => {
                let old_bytes = page.record(i).as_bytes().to_vec();
                let old = RecordRef::new(&old_bytes);
                let previous_custom = if old.is_custom() {
                    old.value(alloc).map(|v| Some(v.into_owned()))
                } else {
                    Ok(None)
                };
                previous_custom.and_then(|previous| {
                    rebuild_record(ctx, old, key, value, opts, placement)
                        .map(|(record, unused)| (record, unused, previous))
                })
            }
            Slot::Vacant(_) => {
                build_record(ctx, key, value, opts, placement).map(|record| (record, Vec::new(), None))
            }
        };
        let (record, unused, previous_custom) = match built {
            Ok(built) => built,
            Err(e) => {
                if page.capacity() > capacity {
                    ctx.stats.release(page.capacity() - capacity);
                    page.resize_capacity(capacity);
                }
                self.compress_if_needed(ctx)?;
                return Err(e);
            }
        };
        let status = match slot {
            Slot::Found(i) => {
                page.replace(i, &record);
                PutStatus::Updated(previous_custom)
            }
            Slot::Vacant(i) => {
                page.insert(i, &record);
                PutStatus::Inserted
            }
        };
        for address in unused {
            ctx.free_external(address)?;
        }
        ctx.stats.adjust_data(before, page.used());
        self.compress_if_needed(ctx)?;
        Ok(status)
    }

    /// Whether overwriting `key` needs no memory beyond its current record
    fn rewrites_for_free(
        &self,
        ctx: &BlockContext,
        key: &[u8],
        value_len: usize,
        placement: Placement,
        new_len: usize,
    ) -> Result<bool> {
        let page = self.page(ctx)?;
        Ok(match page.search(ctx.allocator.as_ref(), key)? {
            Slot::Found(i) => rewrite_is_free(page.record(i), value_len, placement, new_len),
            Slot::Vacant(_) => false,
        })
    }

    /// Remove a record, returning it. The empty-key sentinel is never removed.
    pub fn delete(&mut self, ctx: &BlockContext, key: &[u8]) -> Result<Option<Entry>> {
        if key.is_empty() {
            return Ok(None);
        }
        let alloc = ctx.allocator.as_ref();
        if !self.contains(ctx, key)? {
            return Ok(None);
        }
        let page = self.plain_mut(ctx, true)?;
        let before = page.used();
        let removed = match page.search(alloc, key)? {
            Slot::Found(i) => {
                let rec = page.record(i);
                let entry = rec.to_entry(alloc)?;
                let bytes = rec.as_bytes().to_vec();
                page.remove(i);
                release_record(ctx, RecordRef::new(&bytes))?;
                Some(entry)
            }
            Slot::Vacant(_) => None,
        };
        ctx.stats.adjust_data(before, page.used());
        self.compress_if_needed(ctx)?;
        Ok(removed)
    }

    // =========================================================================
    // Structural Operations
    // =========================================================================

    /// Move the upper half (by bytes) of the records into a new block
    pub fn split(
        &mut self,
        ctx: &BlockContext,
        new_parent: u64,
        force_compact: bool,
    ) -> Result<DataBlock> {
        let page = self.plain_mut(ctx, false)?;
        if page.len() < 2 {
            return Err(BasaltError::Internal(format!(
                "cannot split a block of {} records",
                page.len()
            )));
        }
        let at = page.split_index();
        let tail = page.split_off(at);
        ctx.stats.adjust_data(tail.len(), 0);
        let mut right = match DataBlock::from_packed(ctx, new_parent, &tail) {
            Ok(block) => block,
            Err(e) => {
                page.append(&tail);
                ctx.stats.adjust_data(0, tail.len());
                return Err(e);
            }
        };
        let (left_count, left_size) = (page.len(), page.used());
        debug!(
            parent = self.parent,
            left_count,
            left_size,
            right_count = right.len(),
            right_size = right.data_size(),
            "data block split"
        );
        if force_compact {
            self.compact(ctx, true)?;
        }
        self.compress_if_needed(ctx)?;
        right.compress_if_needed(ctx)?;
        Ok(right)
    }

    /// Append the records of `other`, whose keys all sort after ours.
    ///
    /// Returns false (both blocks untouched) if the union would not fit.
    /// `other` is left empty; with `free_other` its region is released too.
    pub fn merge(
        &mut self,
        ctx: &BlockContext,
        other: &mut DataBlock,
        free_other: bool,
    ) -> Result<bool> {
        self.merge_with(ctx, other, free_other, false)
    }

    /// Fold back the upper half split off by `split`. Decompression is
    /// charged past the memory ceiling since the pair only shrinks.
    pub fn unsplit(&mut self, ctx: &BlockContext, right: &mut DataBlock) -> Result<()> {
        if self.merge_with(ctx, right, true, true)? {
            Ok(())
        } else {
            Err(BasaltError::Internal("split halves no longer fit one block".to_string()))
        }
    }

    fn merge_with(
        &mut self,
        ctx: &BlockContext,
        other: &mut DataBlock,
        free_other: bool,
        admit: bool,
    ) -> Result<bool> {
        let max = ctx.config.max_block_size;
        let needed = self.data_size() + other.data_size();
        let Some(class) = size_class(needed, max) else {
            return Ok(false);
        };
        other.decompress(ctx, admit)?;
        let moved = other.page(ctx)?.used_bytes().to_vec();
        let page = self.plain_mut(ctx, admit)?;
        if class > page.capacity() {
            if admit {
                ctx.stats.charge(class - page.capacity());
            } else {
                ctx.stats.reserve(class - page.capacity())?;
            }
            page.resize_capacity(class);
        }
        page.append(&moved);
        ctx.stats.adjust_data(0, moved.len());
        self.sentinel |= other.sentinel;
        other.clear(ctx);
        if free_other {
            other.release_region(ctx);
        }
        debug!(parent = self.parent, records = self.len(), size = needed, "data blocks merged");
        self.compress_if_needed(ctx)?;
        Ok(true)
    }

    /// Forget every record without freeing what they reference (moved away).
    /// Only called on a plain block.
    fn clear(&mut self, ctx: &BlockContext) {
        let capacity = self.capacity();
        ctx.stats.adjust_data(self.data_size(), 0);
        self.state = BlockState::Plain(RecordPage::new(capacity));
        self.sentinel = false;
    }

    /// Give back the region reservation of an emptied block
    fn release_region(&mut self, ctx: &BlockContext) {
        match &self.state {
            BlockState::Plain(page) => ctx.stats.release(page.capacity()),
            BlockState::Compressed { image, .. } => {
                ctx.stats.release(image.len());
                ctx.stats.adjust_compressed(image.len(), 0);
            }
        }
        ctx.stats.adjust_data(self.data_size(), 0);
        self.state = BlockState::Plain(RecordPage::new(0));
    }

    /// Shrink the region to the smallest size class holding the records.
    ///
    /// With `only_if_beneficial` nothing happens unless memory is reclaimed;
    /// otherwise the records are repacked into a fresh region regardless.
    pub fn compact(&mut self, ctx: &BlockContext, only_if_beneficial: bool) -> Result<bool> {
        let max = ctx.config.max_block_size;
        let page = self.plain_mut(ctx, false)?;
        let target = size_class(page.used(), max).unwrap_or(page.capacity());
        let shrunk = target < page.capacity();
        if shrunk {
            ctx.stats.release(page.capacity() - target);
            page.resize_capacity(target);
        } else if !only_if_beneficial {
            *page = RecordPage::from_bytes(page.used_bytes(), page.capacity());
        }
        self.compress_if_needed(ctx)?;
        Ok(shrunk || !only_if_beneficial)
    }

    /// Replace the record region by its codec image when that saves space
    pub fn compress_if_needed(&mut self, ctx: &BlockContext) -> Result<bool> {
        if ctx.codec.codec_type() == CodecType::None {
            return Ok(false);
        }
        let BlockState::Plain(page) = &self.state else {
            return Ok(false);
        };
        if page.is_empty() {
            return Ok(false);
        }
        let image = ctx.codec.compress(page.used_bytes())?;
        if image.len() >= page.used() {
            return Ok(false);
        }
        let (raw_len, capacity, count) = (page.used(), page.capacity(), page.len());
        ctx.stats.release(capacity - image.len());
        ctx.stats.adjust_compressed(0, image.len());
        self.state = BlockState::Compressed {
            image,
            raw_len,
            capacity,
            count,
        };
        Ok(true)
    }

    /// Restore the plain record region
    pub fn decompress_if_needed(&mut self, ctx: &BlockContext) -> Result<bool> {
        self.decompress(ctx, false)
    }

    fn decompress(&mut self, ctx: &BlockContext, admit: bool) -> Result<bool> {
        let BlockState::Compressed {
            image,
            raw_len,
            capacity,
            ..
        } = &self.state
        else {
            return Ok(false);
        };
        let raw = ctx.codec.decompress(image, *raw_len)?;
        let (image_len, capacity) = (image.len(), *capacity);
        if admit {
            ctx.stats.charge(capacity - image_len);
        } else {
            ctx.stats.reserve(capacity - image_len)?;
        }
        ctx.stats.adjust_compressed(image_len, 0);
        self.state = BlockState::Plain(RecordPage::from_bytes(&raw, capacity));
        Ok(true)
    }

    // =========================================================================
    // Range Access
    // =========================================================================

    /// Copy the records within the bounds, sentinel excluded
    pub fn collect(
        &self,
        ctx: &BlockContext,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<Entry>> {
        let alloc = ctx.allocator.as_ref();
        let page = self.page(ctx)?;
        let start = match lower {
            Bound::Unbounded => 0,
            Bound::Included(key) => match page.search(alloc, key)? {
                Slot::Found(i) | Slot::Vacant(i) => i,
            },
            Bound::Excluded(key) => match page.search(alloc, key)? {
                Slot::Found(i) => i + 1,
                Slot::Vacant(i) => i,
            },
        };
        let mut out = Vec::new();
        for i in start..page.len() {
            let rec = page.record(i);
            if rec.is_empty_key() {
                continue;
            }
            let past_end = match upper {
                Bound::Unbounded => false,
                Bound::Included(key) => rec.compare_key(alloc, key)?.is_gt(),
                Bound::Excluded(key) => !rec.compare_key(alloc, key)?.is_lt(),
            };
            if past_end {
                break;
            }
            out.push(rec.to_entry(alloc)?);
        }
        Ok(out)
    }

    /// Every record except the sentinel
    pub fn entries(&self, ctx: &BlockContext) -> Result<Vec<Entry>> {
        self.collect(ctx, Bound::Unbounded, Bound::Unbounded)
    }

    pub fn scanner(&self, ctx: &BlockContext) -> Result<DataBlockScanner> {
        Ok(DataBlockScanner::new(self.entries(ctx)?))
    }

    /// Free everything the block references and its own region
    pub fn dispose(&mut self, ctx: &BlockContext) -> Result<()> {
        let alloc = ctx.allocator.as_ref();
        let mut first_error = None;
        {
            let page = self.page(ctx)?;
            for rec in page.records() {
                if rec.is_custom() {
                    let released = rec.key(alloc).and_then(|key| {
                        let value = rec.value(alloc)?;
                        match CustomType::from_key(&key) {
                            Some(ty) => ty.release(ctx, &value),
                            None => Ok(()),
                        }
                    });
                    if let Err(e) = released {
                        warn!(error = %e, "failed to release composite value");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                if let Err(e) = release_record(ctx, rec) {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.release_region(ctx);
        self.sentinel = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
