//! Memory Module
//!
//! Raw byte storage addressed by opaque handles.
//!
//! ## Responsibilities
//! - Allocate, free and resize byte regions behind stable `Address` handles
//! - Bounds-checked reads, writes and comparisons against stored bytes
//! - Per-instance and process-wide memory accounting
//! - Thread-local scratch buffers for building temporary keys and values
//!
//! ## Address Model
//! ```text
//! Address (u64)  0 = NULL
//!    │
//!    ▼
//! ┌──────────────────────────────┐
//! │ shard = address % SHARDS     │──► RwLock<HashMap<Address, Box<[u8]>>>
//! └──────────────────────────────┘
//! ```
//!
//! A handle never moves: `resize` keeps the address, so other structures
//! (list segment chains, external record fields) may store it verbatim.

mod arena;
mod scratch;
mod stats;

use std::cmp::Ordering;
use std::fmt::Debug;

pub use arena::HeapArena;
pub use scratch::with_scratch;
pub use stats::{global_stats, MemoryStats, StatsSnapshot};

use crate::error::Result;

/// Opaque handle to an allocated byte region
pub type Address = u64;

/// The "no allocation" handle
pub const NULL_ADDRESS: Address = 0;

/// Allocation capability consumed by blocks and data types
pub trait Allocator: Send + Sync + Debug {
    /// Allocate a zeroed region of `size` bytes
    fn allocate(&self, size: usize) -> Result<Address>;

    /// Free a region, returning its size
    fn free(&self, address: Address) -> Result<usize>;

    /// Grow or shrink a region in place; the address stays valid
    fn resize(&self, address: Address, new_size: usize) -> Result<()>;

    /// Resize a region, returning the handle to use afterwards
    fn reallocate(&self, address: Address, new_size: usize) -> Result<Address> {
        self.resize(address, new_size)?;
        Ok(address)
    }

    /// Size in bytes of an allocated region
    fn size_of(&self, address: Address) -> Result<usize>;

    /// Copy `dst.len()` bytes starting at `offset` out of a region
    fn read(&self, address: Address, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into a region starting at `offset`
    fn write(&self, address: Address, offset: usize, src: &[u8]) -> Result<()>;

    /// Copy a whole region out
    fn load(&self, address: Address) -> Result<Vec<u8>>;

    /// Unsigned lexicographic comparison of a whole region against `other`
    fn compare(&self, address: Address, other: &[u8]) -> Result<Ordering>;

    /// Copy `len` bytes between two regions
    fn copy(
        &self,
        src: Address,
        src_offset: usize,
        dst: Address,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        with_scratch(len, |buf| {
            buf.resize(len, 0);
            self.read(src, src_offset, buf)?;
            self.write(dst, dst_offset, buf)
        })
    }
}

/// Unsigned lexicographic comparison, returning -1, 0 or 1
pub fn compare(a: &[u8], b: &[u8]) -> i32 {
    match a.cmp(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}
