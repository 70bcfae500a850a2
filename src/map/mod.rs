//! Sorted Map Module
//!
//! The top-level navigable map gluing index blocks together.
//!
//! ## Responsibilities
//! - Route point operations to the index block covering the key
//! - Optimistic structural retry around every operation
//! - Promote index block splits into the chain, retire emptied index blocks
//! - Memory accounting, codec configuration, snapshot and load
//! - Forward/reverse scanners in live or safe mode
//!
//! ## Structural Retry
//! ```text
//! locate(key) ──► lock index block ──► still valid and still the floor
//!      ▲                                   for key?        │
//!      │                                no │           yes ▼
//!      └──────── backoff ◄─── Retry ◄──────┘         run operation
//!                                                          │
//!                         NeedsSplit: split index block,   │
//!                         publish it, Retry ◄──────────────┘
//! ```
//!
//! Writers only ever hold one index block lock at a time. Safe scanners
//! take shared locks on several blocks, always in ascending key order.

pub mod operation;
mod scanner;
mod snapshot;

use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

pub use operation::{Mutation, Operation};
pub use scanner::{ScanMode, Scanner};
pub use snapshot::{SnapshotHeader, SNAPSHOT_FILE};

use crate::block::{
    BlockContext, Entry, IndexBlock, IndexExec, IndexPut, PutStatus, RecordOptions,
};
use crate::config::Config;
use crate::error::{BasaltError, Result};
use crate::locker::KeyLocker;
use crate::memory::StatsSnapshot;
use crate::types::CustomType;

/// Retries between "retry storm" warnings
const RETRY_WARN_INTERVAL: usize = 10_000;

type SharedIndex = Arc<RwLock<IndexBlock>>;

/// Result of one attempt under the structural retry protocol
pub(crate) enum Attempt<T> {
    Done(T),
    Retry,
}

/// Options for `SortedMap::put_with_options`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Absolute expiration time in milliseconds since the Unix epoch
    pub expire: Option<u64>,
    /// Value is a composite type header owned by the data-type layer
    pub custom: bool,
}

/// Off-heap sorted map of byte-string keys to byte-string values
pub struct SortedMap {
    ctx: BlockContext,
    /// Index blocks keyed by fence
    index: SkipMap<Vec<u8>, SharedIndex>,
    next_index_id: AtomicU64,
    locker: KeyLocker,
    disposed: AtomicBool,
}

impl fmt::Debug for SortedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedMap")
            .field("index_blocks", &self.index.len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SortedMap {
    /// Create an empty map
    pub fn new(config: Config) -> Result<Self> {
        let ctx = BlockContext::new(config)?;
        let first = IndexBlock::first(&ctx)?;
        let index = SkipMap::new();
        index.insert(Vec::new(), Arc::new(RwLock::new(first)));
        let locker = KeyLocker::new(ctx.config.key_lock_stripes);
        debug!(
            max_block_size = ctx.config.max_block_size,
            max_index_block_size = ctx.config.max_index_block_size,
            codec = ?ctx.config.codec,
            "sorted map created"
        );
        Ok(Self {
            ctx,
            index,
            next_index_id: AtomicU64::new(1),
            locker,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn context(&self) -> &BlockContext {
        &self.ctx
    }

    /// Striped per-key locks for multi-step data-type operations
    pub fn locker(&self) -> &KeyLocker {
        &self.locker
    }

    // =========================================================================
    // Retry Protocol
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BasaltError::Disposed);
        }
        Ok(())
    }

    /// Index block whose fence is the floor of `key`
    fn locate(&self, key: &[u8]) -> Result<SharedIndex> {
        self.index
            .upper_bound(Bound::Included(key))
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BasaltError::Internal("index chain has no first block".to_string()))
    }

    /// Whether a locked block is still the live owner of `key`
    fn routes(&self, block: &SharedIndex, locked: &IndexBlock, key: &[u8]) -> Result<bool> {
        Ok(locked.is_valid() && Arc::ptr_eq(&self.locate(key)?, block))
    }

    pub(crate) fn with_retry<T>(
        &self,
        mut attempt: impl FnMut() -> Result<Attempt<T>>,
    ) -> Result<T> {
        let max_retries = self.ctx.config.max_retries;
        let backoff = Backoff::new();
        for retries in 0..max_retries {
            match attempt()? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry => {
                    if retries > 0 && retries % RETRY_WARN_INTERVAL == 0 {
                        warn!(retries, "structural retry storm");
                    }
                    backoff.snooze();
                }
            }
        }
        error!(max_retries, "structural retry limit exceeded");
        Err(BasaltError::RetryLimitExceeded(max_retries))
    }

    /// Split a full index block and publish the new right half
    fn split_index(&self, block: &mut IndexBlock) -> Result<()> {
        let id = self.next_index_id.fetch_add(1, Ordering::Relaxed);
        let right = block.split(&self.ctx, id)?;
        let fence = right.fence().to_vec();
        debug!(
            index = block.id(),
            new_index = id,
            index_blocks = self.index.len() + 1,
            "index block published"
        );
        self.index.insert(fence, Arc::new(RwLock::new(right)));
        Ok(())
    }

    /// Unpublish and free an index block left without children
    fn retire_index(&self, block: &mut IndexBlock) -> Result<()> {
        if block.fence().is_empty() {
            return Ok(());
        }
        block.invalidate();
        self.index.remove(block.fence());
        debug!(index = block.id(), "empty index block retired");
        block.dispose(&self.ctx)
    }

    fn release_custom(&self, key: &[u8], value: &[u8]) {
        if let Some(ty) = CustomType::from_key(key) {
            if let Err(e) = ty.release(&self.ctx, value) {
                warn!(error = %e, "failed to release composite value");
            }
        }
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Insert or overwrite `key`. Returns false when memory is exhausted.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.put_with_options(key, value, PutOptions::default())
    }

    pub fn put_with_options(&self, key: &[u8], value: &[u8], options: PutOptions) -> Result<bool> {
        self.check_open()?;
        validate_key(key)?;
        let opts = RecordOptions {
            expire: options.expire,
            custom: options.custom,
        };
        let outcome = self.with_retry(|| {
            let block = self.locate(key)?;
            let mut guard = block.write();
            if !self.routes(&block, &guard, key)? {
                return Ok(Attempt::Retry);
            }
            match guard.put(&self.ctx, key, value, &opts) {
                Ok(IndexPut::Done(status)) => Ok(Attempt::Done(Some(status))),
                Ok(IndexPut::NeedsSplit) => match self.split_index(&mut guard) {
                    Ok(()) => Ok(Attempt::Retry),
                    Err(BasaltError::OutOfMemory { .. }) => Ok(Attempt::Done(None)),
                    Err(e) => Err(e),
                },
                Err(BasaltError::OutOfMemory { .. }) => Ok(Attempt::Done(None)),
                Err(e) => Err(e),
            }
        })?;
        match outcome {
            None => {
                debug!(key_len = key.len(), value_len = value.len(), "put refused: out of memory");
                Ok(false)
            }
            Some(PutStatus::Updated(Some(previous))) if !options.custom => {
                self.release_custom(key, &previous);
                Ok(true)
            }
            Some(_) => Ok(true),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_entry(key)?.map(|e| e.value))
    }

    /// Full record for `key`, including expire and custom flag
    pub fn get_entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        if key.is_empty() {
            return Ok(None);
        }
        self.with_retry(|| {
            let block = self.locate(key)?;
            let guard = block.read();
            if !self.routes(&block, &guard, key)? {
                return Ok(Attempt::Retry);
            }
            Ok(Attempt::Done(guard.get(&self.ctx, key)?))
        })
    }

    pub fn get_expire(&self, key: &[u8]) -> Result<Option<u64>> {
        Ok(self.get_entry(key)?.and_then(|e| e.expire))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        if key.is_empty() {
            return Ok(false);
        }
        self.with_retry(|| {
            let block = self.locate(key)?;
            let guard = block.read();
            if !self.routes(&block, &guard, key)? {
                return Ok(Attempt::Retry);
            }
            Ok(Attempt::Done(guard.contains(&self.ctx, key)?))
        })
    }

    /// Remove `key`, releasing any composite value it held
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.remove_record(key, true)?.is_some())
    }

    /// Remove `key`; composite values are released only when asked to
    pub(crate) fn remove_record(&self, key: &[u8], release_custom: bool) -> Result<Option<Entry>> {
        self.check_open()?;
        if key.is_empty() {
            return Ok(None);
        }
        let removed = self.with_retry(|| {
            let block = self.locate(key)?;
            let mut guard = block.write();
            if !self.routes(&block, &guard, key)? {
                return Ok(Attempt::Retry);
            }
            let outcome = guard.delete(&self.ctx, key)?;
            if outcome.now_empty {
                self.retire_index(&mut guard)?;
            }
            Ok(Attempt::Done(outcome.removed))
        })?;
        if release_custom {
            if let Some(entry) = removed.as_ref().filter(|e| e.custom) {
                self.release_custom(key, &entry.value);
            }
        }
        Ok(removed)
    }

    /// Run a read-modify-write operation atomically against its record
    pub fn execute(&self, op: &mut dyn Operation) -> Result<bool> {
        self.check_open()?;
        let key = op.key().to_vec();
        validate_key(&key)?;
        let read_only = op.is_read_only();
        let (result, displaced) = self.with_retry(|| {
            op.reset();
            let block = self.locate(&key)?;
            if read_only {
                let guard = block.read();
                if !self.routes(&block, &guard, &key)? {
                    return Ok(Attempt::Retry);
                }
                let found = guard.get(&self.ctx, &key)?;
                return Ok(Attempt::Done((op.execute(found.as_ref()), None)));
            }
            let mut guard = block.write();
            if !self.routes(&block, &guard, &key)? {
                return Ok(Attempt::Retry);
            }
            match guard.execute(&self.ctx, &mut *op)? {
                IndexExec::NeedsSplit => {
                    self.split_index(&mut guard)?;
                    Ok(Attempt::Retry)
                }
                IndexExec::Done {
                    result,
                    displaced_custom,
                    now_empty,
                } => {
                    if now_empty {
                        self.retire_index(&mut guard)?;
                    }
                    Ok(Attempt::Done((result, displaced_custom)))
                }
            }
        })?;
        if let Some(value) = displaced {
            self.release_custom(&key, &value);
        }
        Ok(result)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Number of records, sentinel excluded
    pub fn count_records(&self) -> Result<usize> {
        self.check_open()?;
        Ok(self
            .index
            .iter()
            .map(|e| e.value().read().record_count())
            .sum())
    }

    pub fn number_of_index_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn number_of_data_blocks(&self) -> usize {
        self.index
            .iter()
            .map(|e| e.value().read().number_of_data_blocks())
            .sum()
    }

    pub fn memory_stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Shrink every data block to its smallest size class
    pub fn compact(&self) -> Result<usize> {
        self.check_open()?;
        let mut shrunk = 0;
        for entry in self.index.iter() {
            shrunk += entry.value().write().compact_children(&self.ctx)?;
        }
        debug!(shrunk, "map compacted");
        Ok(shrunk)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Free every block and composite value; later calls fail with `Disposed`
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_error = None;
        for entry in self.index.iter() {
            let mut guard = entry.value().write();
            guard.invalidate();
            if let Err(e) = guard.dispose(&self.ctx) {
                first_error.get_or_insert(e);
            }
        }
        self.index.clear();
        info!(allocated = self.ctx.stats.snapshot().allocated_memory, "sorted map disposed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for SortedMap {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(error = %e, "error while disposing sorted map");
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(BasaltError::InvalidKey("empty key is reserved".to_string()));
    }
    if key.len() > u32::MAX as usize {
        return Err(BasaltError::InvalidKey(format!("key of {} bytes", key.len())));
    }
    Ok(())
}
