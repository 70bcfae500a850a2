//! Index Block
//!
//! A sorted directory of data blocks. Each entry maps the lower bound of a
//! child's key range to the slot holding that child:
//!
//! ```text
//! fence = "" ─────────────────────────────────────────────┐
//! ┌──────────────┬──────────────┬──────────────┐          │
//! │ ""    → 0    │ "k100" → 2   │ "k250" → 1   │  entries │
//! └──────┬───────┴──────┬───────┴──────┬───────┘          │
//!        ▼              ▼              ▼                  │
//!   children[0]    children[2]    children[1]   (slots)   │
//! ```
//!
//! The first entry's key always equals the block's own fence, and entry keys
//! partition the block's key range with no gaps: a key belongs to the last
//! entry whose key is `<=` it.

use std::ops::Bound;

use bytes::Buf;
use tracing::debug;

use super::page::RecordPage;
use super::record::{build_record, release_record, Placement, RecordRef};
use super::{BlockContext, DataBlock, Entry, PutStatus, RecordOptions};
use crate::error::{BasaltError, Result};
use crate::map::operation::{Mutation, Operation};

/// Local split attempts before giving up on a single put
const MAX_LOCAL_SPLITS: usize = 4;

/// Outcome of an index block put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexPut {
    Done(PutStatus),
    /// No room left for another child entry; the index block must split first
    NeedsSplit,
}

/// Outcome of an index block delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDelete {
    pub removed: Option<Entry>,
    /// The block has no children left
    pub now_empty: bool,
}

/// Outcome of running an operation against an index block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExec {
    Done {
        result: bool,
        /// Custom value deleted or overwritten by a plain value
        displaced_custom: Option<Vec<u8>>,
        now_empty: bool,
    },
    NeedsSplit,
}

#[derive(Debug)]
pub struct IndexBlock {
    id: u64,
    /// Lower bound of the keys this block routes
    fence: Vec<u8>,
    valid: bool,
    page: RecordPage,
    children: Vec<Option<DataBlock>>,
    free_slots: Vec<u32>,
}

impl IndexBlock {
    /// Create an empty index block
    pub fn new(ctx: &BlockContext, id: u64, fence: Vec<u8>) -> Result<Self> {
        let capacity = ctx.config.max_index_block_size;
        ctx.stats.reserve(capacity)?;
        Ok(Self {
            id,
            fence,
            valid: true,
            page: RecordPage::new(capacity),
            children: Vec::new(),
            free_slots: Vec::new(),
        })
    }

    /// Create the first index block of a map, owning the sentinel block
    pub fn first(ctx: &BlockContext) -> Result<Self> {
        let mut block = Self::new(ctx, 0, Vec::new())?;
        let child = DataBlock::with_sentinel(ctx, 0)?;
        block.attach(ctx, 0, b"", child)?;
        Ok(block)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fence(&self) -> &[u8] {
        &self.fence
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the block as retired; operations that reach it must retry
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_empty(&self) -> bool {
        self.page.is_empty()
    }

    pub fn number_of_data_blocks(&self) -> usize {
        self.page.len()
    }

    /// Records across all children, sentinel excluded
    pub fn record_count(&self) -> usize {
        self.children.iter().flatten().map(|c| c.record_count()).sum()
    }

    pub fn first_block(&self) -> Option<&DataBlock> {
        if self.page.is_empty() {
            return None;
        }
        self.child(0).ok()
    }

    pub fn last_block(&self) -> Option<&DataBlock> {
        if self.page.is_empty() {
            return None;
        }
        self.child(self.page.len() - 1).ok()
    }

    /// Data blocks in key order
    pub fn data_blocks(&self) -> impl Iterator<Item = &DataBlock> + '_ {
        (0..self.page.len()).filter_map(move |i| self.child(i).ok())
    }

    /// Lower-bound key of entry `i`
    pub fn entry_key(&self, ctx: &BlockContext, i: usize) -> Result<Vec<u8>> {
        Ok(self
            .page
            .record(i)
            .key(ctx.allocator.as_ref())?
            .into_owned())
    }

    fn slot_at(&self, i: usize) -> usize {
        self.page.record(i).value_field().get_u64_le() as usize
    }

    fn child(&self, i: usize) -> Result<&DataBlock> {
        let slot = self.slot_at(i);
        self.children
            .get(slot)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| BasaltError::Internal(format!("index {} slot {} empty", self.id, slot)))
    }

    fn child_mut(&mut self, i: usize) -> Result<&mut DataBlock> {
        let slot = self.slot_at(i);
        let id = self.id;
        self.children
            .get_mut(slot)
            .and_then(|c| c.as_mut())
            .ok_or_else(|| BasaltError::Internal(format!("index {} slot {} empty", id, slot)))
    }

    fn has_room_for_entry(&self, ctx: &BlockContext) -> bool {
        self.page.free_space() >= ctx.external_threshold()
    }

    /// Entry position routing `key`
    fn locate_child(&self, ctx: &BlockContext, key: &[u8]) -> Result<usize> {
        self.page
            .floor(ctx.allocator.as_ref(), key)?
            .ok_or_else(|| BasaltError::Internal(format!("key routed below fence of index {}", self.id)))
    }

    fn encode_entry(ctx: &BlockContext, key: &[u8], slot: usize) -> Result<Vec<u8>> {
        let placement = Placement::for_index_entry(key.len(), ctx.external_threshold());
        build_record(
            ctx,
            key,
            &(slot as u64).to_le_bytes(),
            &RecordOptions::default(),
            placement,
        )
    }

    /// Slot the next installed child will occupy
    fn next_slot(&self) -> usize {
        self.free_slots
            .last()
            .map_or(self.children.len(), |&slot| slot as usize)
    }

    fn no_room(&self) -> BasaltError {
        BasaltError::Internal(format!("index {} has no room for a new entry", self.id))
    }

    /// Register `child` under `key` at entry position `pos`
    fn attach(&mut self, ctx: &BlockContext, pos: usize, key: &[u8], child: DataBlock) -> Result<()> {
        let entry = Self::encode_entry(ctx, key, self.next_slot())?;
        if let Err(mut child) = self.install(pos, &entry, child) {
            release_record(ctx, RecordRef::new(&entry))?;
            child.dispose(ctx)?;
            return Err(self.no_room());
        }
        Ok(())
    }

    /// Insert an entry encoded for `next_slot` and place `child` in that
    /// slot. Hands the child back if the page is full.
    fn install(&mut self, pos: usize, entry: &[u8], mut child: DataBlock) -> std::result::Result<(), DataBlock> {
        if !self.page.insert(pos, entry) {
            return Err(child);
        }
        child.set_parent(self.id);
        match self.free_slots.pop() {
            Some(slot) => self.children[slot as usize] = Some(child),
            None => self.children.push(Some(child)),
        }
        Ok(())
    }

    /// Drop entry `i` from the page, freeing its key if external
    fn remove_entry(&mut self, ctx: &BlockContext, i: usize) -> Result<()> {
        let bytes = self.page.record(i).as_bytes().to_vec();
        self.page.remove(i);
        release_record(ctx, RecordRef::new(&bytes))
    }

    /// Swap entry `i` for an already encoded one
    fn replace_entry(&mut self, ctx: &BlockContext, i: usize, entry: &[u8]) -> Result<()> {
        let old = self.page.record(i).as_bytes().to_vec();
        if !self.page.replace(i, entry) {
            release_record(ctx, RecordRef::new(entry))?;
            return Err(BasaltError::Internal("index entry rekey overflow".to_string()));
        }
        release_record(ctx, RecordRef::new(&old))
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&self, ctx: &BlockContext, key: &[u8]) -> Result<Option<Entry>> {
        let i = self.locate_child(ctx, key)?;
        self.child(i)?.get(ctx, key)
    }

    pub fn contains(&self, ctx: &BlockContext, key: &[u8]) -> Result<bool> {
        let i = self.locate_child(ctx, key)?;
        self.child(i)?.contains(ctx, key)
    }

    /// Insert or overwrite a record, splitting the target data block if full
    pub fn put(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        value: &[u8],
        opts: &RecordOptions,
    ) -> Result<IndexPut> {
        let mut splits = Vec::new();
        let outcome = self.put_splitting(ctx, key, value, opts, &mut splits);
        if !matches!(outcome, Ok(IndexPut::Done(_))) {
            // leave the children as they were before this put
            for &i in splits.iter().rev() {
                self.merge_children(ctx, i, true)?;
            }
        }
        outcome
    }

    fn put_splitting(
        &mut self,
        ctx: &BlockContext,
        key: &[u8],
        value: &[u8],
        opts: &RecordOptions,
        splits: &mut Vec<usize>,
    ) -> Result<IndexPut> {
        for _ in 0..MAX_LOCAL_SPLITS {
            let i = self.locate_child(ctx, key)?;
            match self.child_mut(i)?.put(ctx, key, value, opts)? {
                PutStatus::Full => {}
                status => return Ok(IndexPut::Done(status)),
            }
            if !self.has_room_for_entry(ctx) {
                return Ok(IndexPut::NeedsSplit);
            }
            self.split_child(ctx, i)?;
            splits.push(i);
        }
        Err(BasaltError::Internal(format!(
            "record of {} bytes does not fit after {} splits",
            key.len() + value.len(),
            MAX_LOCAL_SPLITS
        )))
    }

    /// Split child `i`, registering the upper half at `i + 1`. On failure the
    /// halves are folded back together.
    fn split_child(&mut self, ctx: &BlockContext, i: usize) -> Result<()> {
        let id = self.id;
        let slot = self.next_slot();
        let mut right = self.child_mut(i)?.split(ctx, id, false)?;
        let entry = right.first_key(ctx).and_then(|key| {
            let key = key.ok_or_else(|| BasaltError::Internal("split produced an empty block".to_string()))?;
            Self::encode_entry(ctx, &key, slot)
        });
        let failure = match entry {
            Ok(entry) => match self.install(i + 1, &entry, right) {
                Ok(()) => {
                    debug!(index = id, position = i, data_blocks = self.page.len(), "data block split registered");
                    return Ok(());
                }
                Err(child) => {
                    right = child;
                    release_record(ctx, RecordRef::new(&entry))?;
                    self.no_room()
                }
            },
            Err(e) => e,
        };
        self.child_mut(i)?.unsplit(ctx, &mut right)?;
        Err(failure)
    }

    /// Remove a record; emptied children are dropped and small ones merged
    pub fn delete(&mut self, ctx: &BlockContext, key: &[u8]) -> Result<IndexDelete> {
        let i = self.locate_child(ctx, key)?;
        // a first child about to empty hands its fence to the next entry;
        // that entry is encoded before anything is removed
        let handover = if i == 0 && self.page.len() > 1 && self.child(i)?.len() == 1 {
            Some(Self::encode_entry(ctx, &self.entry_key(ctx, 0)?, self.slot_at(1))?)
        } else {
            None
        };
        let removed = match self.child_mut(i)?.delete(ctx, key) {
            Ok(removed) => removed,
            Err(e) => {
                if let Some(entry) = &handover {
                    release_record(ctx, RecordRef::new(entry))?;
                }
                return Err(e);
            }
        };
        if removed.is_some() && self.child(i)?.is_empty() {
            self.remove_child(ctx, i, handover)?;
        } else {
            if let Some(entry) = &handover {
                release_record(ctx, RecordRef::new(entry))?;
            }
            if removed.is_some() {
                self.merge_underfull(ctx, i)?;
            }
        }
        Ok(IndexDelete {
            removed,
            now_empty: self.page.is_empty(),
        })
    }

    fn remove_child(&mut self, ctx: &BlockContext, i: usize, handover: Option<Vec<u8>>) -> Result<()> {
        let slot = self.slot_at(i);
        if let Some(mut child) = self.children[slot].take() {
            child.dispose(ctx)?;
        }
        self.free_slots.push(slot as u32);
        self.remove_entry(ctx, i)?;
        if let Some(entry) = handover {
            self.replace_entry(ctx, 0, &entry)?;
        }
        debug!(index = self.id, position = i, data_blocks = self.page.len(), "empty data block removed");
        Ok(())
    }

    /// Merge child `i` with a neighbour once it falls under a quarter full
    fn merge_underfull(&mut self, ctx: &BlockContext, i: usize) -> Result<()> {
        let max = ctx.config.max_block_size;
        let size = self.child(i)?.data_size();
        if size >= max / 4 {
            return Ok(());
        }
        let limit = max * 3 / 4;
        let left = if i + 1 < self.page.len() && size + self.child(i + 1)?.data_size() <= limit {
            i
        } else if i > 0 && size + self.child(i - 1)?.data_size() <= limit {
            i - 1
        } else {
            return Ok(());
        };
        // merging is housekeeping: a delete still succeeds at the memory ceiling
        match self.merge_children(ctx, left, false) {
            Err(BasaltError::OutOfMemory { .. }) => Ok(()),
            other => other,
        }
    }

    /// Fold child `left + 1` into child `left`. `undo_split` reverses a split
    /// made moments ago and may not be refused for memory.
    fn merge_children(&mut self, ctx: &BlockContext, left: usize, undo_split: bool) -> Result<()> {
        let (left_slot, right_slot) = (self.slot_at(left), self.slot_at(left + 1));
        let mut right = self.children[right_slot]
            .take()
            .ok_or_else(|| BasaltError::Internal(format!("slot {} empty", right_slot)))?;
        let merged = match self.children[left_slot].as_mut() {
            Some(block) if undo_split => block.unsplit(ctx, &mut right).map(|()| true),
            Some(block) => block.merge(ctx, &mut right, true),
            None => Err(BasaltError::Internal(format!("slot {} empty", left_slot))),
        };
        match merged {
            Ok(true) => {
                self.free_slots.push(right_slot as u32);
                self.remove_entry(ctx, left + 1)?;
                debug!(index = self.id, position = left, data_blocks = self.page.len(), "data blocks merged");
                Ok(())
            }
            Ok(false) => {
                self.children[right_slot] = Some(right);
                Ok(())
            }
            Err(e) => {
                self.children[right_slot] = Some(right);
                Err(e)
            }
        }
    }

    /// Run a read-modify-write operation against the record for its key
    pub fn execute(&mut self, ctx: &BlockContext, op: &mut dyn Operation) -> Result<IndexExec> {
        let key = op.key().to_vec();
        let i = self.locate_child(ctx, &key)?;
        let found = self.child(i)?.get(ctx, &key)?;
        let result = op.execute(found.as_ref());
        match op.take_mutation() {
            Mutation::None => Ok(IndexExec::Done {
                result,
                displaced_custom: None,
                now_empty: false,
            }),
            Mutation::Put {
                value,
                expire,
                custom,
            } => {
                if key.is_empty() {
                    return Err(BasaltError::InvalidKey("empty key".to_string()));
                }
                let opts = RecordOptions { expire, custom };
                match self.put(ctx, &key, &value, &opts)? {
                    IndexPut::NeedsSplit => Ok(IndexExec::NeedsSplit),
                    IndexPut::Done(status) => {
                        let displaced_custom = match status {
                            PutStatus::Updated(previous) if !custom => previous,
                            _ => None,
                        };
                        Ok(IndexExec::Done {
                            result,
                            displaced_custom,
                            now_empty: false,
                        })
                    }
                }
            }
            Mutation::Delete => {
                let deleted = self.delete(ctx, &key)?;
                Ok(IndexExec::Done {
                    result,
                    displaced_custom: deleted.removed.filter(|e| e.custom).map(|e| e.value),
                    now_empty: deleted.now_empty,
                })
            }
        }
    }

    // =========================================================================
    // Structural Operations
    // =========================================================================

    /// Move the upper half (by bytes) of the entries and their children into
    /// a new index block whose fence is the first moved entry
    pub fn split(&mut self, ctx: &BlockContext, new_id: u64) -> Result<IndexBlock> {
        if self.page.len() < 2 {
            return Err(BasaltError::Internal(format!(
                "cannot split index {} of {} entries",
                self.id,
                self.page.len()
            )));
        }
        let capacity = ctx.config.max_index_block_size;
        ctx.stats.reserve(capacity)?;
        let at = self.page.split_index();
        let moved = self.page.split_off(at);
        let mut page = RecordPage::from_bytes(&moved, capacity);

        let mut children = Vec::with_capacity(page.len());
        for j in 0..page.len() {
            let old_slot = page.record(j).value_field().get_u64_le() as usize;
            let mut child = self.children[old_slot]
                .take()
                .ok_or_else(|| BasaltError::Internal(format!("slot {} empty", old_slot)))?;
            self.free_slots.push(old_slot as u32);
            child.set_parent(new_id);
            children.push(Some(child));
            page.value_field_mut(j)
                .copy_from_slice(&(j as u64).to_le_bytes());
        }
        let fence = page.record(0).key(ctx.allocator.as_ref())?.into_owned();
        debug!(
            index = self.id,
            new_index = new_id,
            left_entries = self.page.len(),
            right_entries = page.len(),
            "index block split"
        );
        Ok(IndexBlock {
            id: new_id,
            fence,
            valid: true,
            page,
            children,
            free_slots: Vec::new(),
        })
    }

    /// Compact every child, returning how many shrank
    pub fn compact_children(&mut self, ctx: &BlockContext) -> Result<usize> {
        let mut shrunk = 0;
        for child in self.children.iter_mut().flatten() {
            if child.compact(ctx, true)? {
                shrunk += 1;
            }
        }
        Ok(shrunk)
    }

    // =========================================================================
    // Range Access
    // =========================================================================

    fn start_position(&self, ctx: &BlockContext, bound: Bound<&[u8]>) -> Result<usize> {
        Ok(match bound {
            Bound::Unbounded => 0,
            Bound::Included(key) | Bound::Excluded(key) => {
                self.page.floor(ctx.allocator.as_ref(), key)?.unwrap_or(0)
            }
        })
    }

    /// Copy every record within the bounds
    pub fn collect_range(
        &self,
        ctx: &BlockContext,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<Entry>> {
        let alloc = ctx.allocator.as_ref();
        let mut out = Vec::new();
        for i in self.start_position(ctx, lower)?..self.page.len() {
            let beyond = match upper {
                Bound::Unbounded => false,
                Bound::Included(key) => self.page.record(i).compare_key(alloc, key)?.is_gt(),
                Bound::Excluded(key) => !self.page.record(i).compare_key(alloc, key)?.is_lt(),
            };
            if beyond {
                break;
            }
            out.extend(self.child(i)?.collect(ctx, lower, upper)?);
        }
        Ok(out)
    }

    /// Records of the first child holding anything after `from`
    pub fn collect_after(&self, ctx: &BlockContext, from: Bound<&[u8]>) -> Result<Option<Vec<Entry>>> {
        for i in self.start_position(ctx, from)?..self.page.len() {
            let window = self.child(i)?.collect(ctx, from, Bound::Unbounded)?;
            if !window.is_empty() {
                return Ok(Some(window));
            }
        }
        Ok(None)
    }

    /// Records of the last child holding anything before `to`
    pub fn collect_before(&self, ctx: &BlockContext, to: Bound<&[u8]>) -> Result<Option<Vec<Entry>>> {
        if self.page.is_empty() {
            return Ok(None);
        }
        let start = match to {
            Bound::Unbounded => self.page.len() - 1,
            Bound::Included(key) | Bound::Excluded(key) => {
                match self.page.floor(ctx.allocator.as_ref(), key)? {
                    Some(i) => i,
                    None => return Ok(None),
                }
            }
        };
        for i in (0..=start).rev() {
            let window = self.child(i)?.collect(ctx, Bound::Unbounded, to)?;
            if !window.is_empty() {
                return Ok(Some(window));
            }
        }
        Ok(None)
    }

    /// Free every child, every external entry key and the page itself
    pub fn dispose(&mut self, ctx: &BlockContext) -> Result<()> {
        let mut first_error = None;
        for child in self.children.iter_mut() {
            if let Some(mut block) = child.take() {
                if let Err(e) = block.dispose(ctx) {
                    first_error.get_or_insert(e);
                }
            }
        }
        for rec in self.page.records() {
            if let Err(e) = release_record(ctx, rec) {
                first_error.get_or_insert(e);
            }
        }
        ctx.stats.release(self.page.capacity());
        self.page = RecordPage::new(0);
        self.free_slots.clear();
        self.valid = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
