//! Heap-backed arena
//!
//! Regions are boxed byte slices spread over a fixed number of shards so that
//! unrelated handles rarely contend on the same lock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Address, Allocator, MemoryStats, NULL_ADDRESS};
use crate::error::{BasaltError, Result};

const SHARDS: usize = 64;

type Shard = RwLock<HashMap<Address, Box<[u8]>>>;

/// Default `Allocator`: sharded maps of boxed buffers
#[derive(Debug)]
pub struct HeapArena {
    shards: Box<[Shard]>,
    next_address: AtomicU64,
    stats: Arc<MemoryStats>,
}

impl HeapArena {
    /// Create an arena charging its allocations to `stats`
    pub fn new(stats: Arc<MemoryStats>) -> Self {
        let shards = (0..SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            next_address: AtomicU64::new(NULL_ADDRESS + 1),
            stats,
        }
    }

    fn shard(&self, address: Address) -> &Shard {
        &self.shards[(address % SHARDS as u64) as usize]
    }
}

fn check_range(address: Address, buf_len: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= buf_len => Ok(()),
        _ => Err(BasaltError::OutOfBounds {
            address,
            offset,
            len,
        }),
    }
}

impl Allocator for HeapArena {
    fn allocate(&self, size: usize) -> Result<Address> {
        self.stats.reserve(size)?;
        let address = self.next_address.fetch_add(1, Ordering::Relaxed);
        self.shard(address)
            .write()
            .insert(address, vec![0u8; size].into_boxed_slice());
        Ok(address)
    }

    fn free(&self, address: Address) -> Result<usize> {
        let region = self
            .shard(address)
            .write()
            .remove(&address)
            .ok_or(BasaltError::InvalidAddress(address))?;
        self.stats.release(region.len());
        Ok(region.len())
    }

    fn resize(&self, address: Address, new_size: usize) -> Result<()> {
        let mut shard = self.shard(address).write();
        let region = shard
            .get_mut(&address)
            .ok_or(BasaltError::InvalidAddress(address))?;
        let old_size = region.len();
        match new_size.cmp(&old_size) {
            CmpOrdering::Equal => return Ok(()),
            CmpOrdering::Greater => self.stats.reserve(new_size - old_size)?,
            CmpOrdering::Less => self.stats.release(old_size - new_size),
        }
        let mut bytes = std::mem::take(region).into_vec();
        bytes.resize(new_size, 0);
        *region = bytes.into_boxed_slice();
        Ok(())
    }

    fn size_of(&self, address: Address) -> Result<usize> {
        self.shard(address)
            .read()
            .get(&address)
            .map(|r| r.len())
            .ok_or(BasaltError::InvalidAddress(address))
    }

    fn read(&self, address: Address, offset: usize, dst: &mut [u8]) -> Result<()> {
        let shard = self.shard(address).read();
        let region = shard
            .get(&address)
            .ok_or(BasaltError::InvalidAddress(address))?;
        check_range(address, region.len(), offset, dst.len())?;
        dst.copy_from_slice(&region[offset..offset + dst.len()]);
        Ok(())
    }

    fn write(&self, address: Address, offset: usize, src: &[u8]) -> Result<()> {
        let mut shard = self.shard(address).write();
        let region = shard
            .get_mut(&address)
            .ok_or(BasaltError::InvalidAddress(address))?;
        check_range(address, region.len(), offset, src.len())?;
        region[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn load(&self, address: Address) -> Result<Vec<u8>> {
        self.shard(address)
            .read()
            .get(&address)
            .map(|r| r.to_vec())
            .ok_or(BasaltError::InvalidAddress(address))
    }

    fn compare(&self, address: Address, other: &[u8]) -> Result<CmpOrdering> {
        self.shard(address)
            .read()
            .get(&address)
            .map(|r| r.as_ref().cmp(other))
            .ok_or(BasaltError::InvalidAddress(address))
    }
}
