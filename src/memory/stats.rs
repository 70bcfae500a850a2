//! Memory accounting
//!
//! Every counter is an independent atomic. Increments and decrements pair up
//! per allocation; readers only ever see a loosely consistent view.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::error::{BasaltError, Result};

static GLOBAL_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static GLOBAL_EXTERNAL: AtomicU64 = AtomicU64::new(0);
static GLOBAL_DATA: AtomicU64 = AtomicU64::new(0);
static GLOBAL_COMPRESSED: AtomicU64 = AtomicU64::new(0);

/// Point-in-time copy of a set of counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Bytes currently reserved (block regions, external values, segments)
    pub allocated_memory: u64,
    /// Bytes of keys and values stored outside their block
    pub external_data_size: u64,
    /// Uncompressed record bytes held in data blocks
    pub data_size: u64,
    /// Bytes of compressed data block images
    pub compressed_data_size: u64,
    /// Configured ceiling (0 = unlimited)
    pub max_memory: u64,
}

/// Counters across every map in the process
pub fn global_stats() -> StatsSnapshot {
    StatsSnapshot {
        allocated_memory: GLOBAL_ALLOCATED.load(Ordering::Relaxed),
        external_data_size: GLOBAL_EXTERNAL.load(Ordering::Relaxed),
        data_size: GLOBAL_DATA.load(Ordering::Relaxed),
        compressed_data_size: GLOBAL_COMPRESSED.load(Ordering::Relaxed),
        max_memory: 0,
    }
}

/// Per-instance memory counters with an optional ceiling
#[derive(Debug, Default)]
pub struct MemoryStats {
    allocated: AtomicU64,
    external_data: AtomicU64,
    data_size: AtomicU64,
    compressed_data_size: AtomicU64,
    limit: u64,
}

impl MemoryStats {
    /// Create counters with a ceiling (0 = unlimited)
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Account for `bytes` of new memory, failing if the ceiling would be crossed
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let bytes = bytes as u64;
        if self.limit == 0 {
            self.allocated.fetch_add(bytes, Ordering::Relaxed);
        } else {
            let mut current = self.allocated.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_add(bytes);
                if next > self.limit {
                    trace!(requested = bytes, current, limit = self.limit, "reservation refused");
                    return Err(BasaltError::OutOfMemory {
                        requested: bytes as usize,
                        limit: self.limit,
                    });
                }
                match self.allocated.compare_exchange_weak(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
        GLOBAL_ALLOCATED.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// Account for `bytes` without consulting the ceiling. Only for transient
    /// working space of writes that do not grow the map.
    pub fn charge(&self, bytes: usize) {
        self.allocated.fetch_add(bytes as u64, Ordering::Relaxed);
        GLOBAL_ALLOCATED.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Return `bytes` previously reserved
    pub fn release(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
        GLOBAL_ALLOCATED.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn add_external(&self, bytes: usize) {
        self.external_data.fetch_add(bytes as u64, Ordering::Relaxed);
        GLOBAL_EXTERNAL.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sub_external(&self, bytes: usize) {
        self.external_data.fetch_sub(bytes as u64, Ordering::Relaxed);
        GLOBAL_EXTERNAL.fetch_sub(bytes as u64, Ordering::Relaxed);
    }

    /// Apply a signed change to the uncompressed data size
    pub fn adjust_data(&self, before: usize, after: usize) {
        adjust(&self.data_size, &GLOBAL_DATA, before, after);
    }

    /// Apply a signed change to the compressed image size
    pub fn adjust_compressed(&self, before: usize, after: usize) {
        adjust(&self.compressed_data_size, &GLOBAL_COMPRESSED, before, after);
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocated_memory: self.allocated.load(Ordering::Relaxed),
            external_data_size: self.external_data.load(Ordering::Relaxed),
            data_size: self.data_size.load(Ordering::Relaxed),
            compressed_data_size: self.compressed_data_size.load(Ordering::Relaxed),
            max_memory: self.limit,
        }
    }
}

fn adjust(local: &AtomicU64, global: &AtomicU64, before: usize, after: usize) {
    if after >= before {
        let delta = (after - before) as u64;
        local.fetch_add(delta, Ordering::Relaxed);
        global.fetch_add(delta, Ordering::Relaxed);
    } else {
        let delta = (before - after) as u64;
        local.fetch_sub(delta, Ordering::Relaxed);
        global.fetch_sub(delta, Ordering::Relaxed);
    }
}
