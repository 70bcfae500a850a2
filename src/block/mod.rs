//! Block Module
//!
//! Sorted record containers making up the two-level storage structure.
//!
//! ## Responsibilities
//! - Record layout and inline/external placement policy
//! - Data blocks: sorted, size-classed record regions with split, merge,
//!   compaction and optional compression
//! - Index blocks: sorted directories of data blocks keyed by lower bound
//! - Block scanners
//!
//! ## Layout
//! ```text
//! IndexBlock (fence = lower bound of its key range)
//! ┌───────────────────────────────────────────────┐
//! │ entry: [fence key] → [child slot u64]          │──► DataBlock
//! │ entry: [fence key] → [child slot u64]          │──► DataBlock
//! │ ...                                           │
//! └───────────────────────────────────────────────┘
//!
//! DataBlock record region (densely packed, ascending keys)
//! ┌────────┬────────┬────────┬─────────────┐
//! │ rec 0  │ rec 1  │ rec 2  │ free space  │
//! └────────┴────────┴────────┴─────────────┘
//! ```
//!
//! Blocks are not internally synchronized: every block is owned by an index
//! block, and the map guards each index block with its own `RwLock`.

pub mod data;
pub mod index;
pub mod page;
pub mod record;
pub mod scanner;

use std::sync::Arc;

pub use data::DataBlock;
pub use index::{IndexBlock, IndexDelete, IndexExec, IndexPut};
pub use scanner::{DataBlockScanner, ScanState};

use crate::codec::{codec_for, Codec};
use crate::config::Config;
use crate::error::Result;
use crate::memory::{Address, Allocator, HeapArena, MemoryStats};

/// An owned record copied out of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Absolute expiration time in milliseconds since the Unix epoch
    pub expire: Option<u64>,
    /// Value is the header of a composite type (see `types::CustomType`)
    pub custom: bool,
}

/// Per-record options carried alongside a put
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOptions {
    pub expire: Option<u64>,
    pub custom: bool,
}

/// Outcome of a data block put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutStatus {
    /// New key
    Inserted,
    /// Existing key overwritten; carries the previous value if it was custom
    Updated(Option<Vec<u8>>),
    /// Not enough room even at the maximum size class
    Full,
}

/// Shared state every block operation needs
#[derive(Debug)]
pub struct BlockContext {
    pub config: Config,
    pub allocator: Arc<dyn Allocator>,
    pub codec: Arc<dyn Codec>,
    pub stats: Arc<MemoryStats>,
}

impl BlockContext {
    /// Build a context with a fresh heap arena charging into fresh counters
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(MemoryStats::new(config.max_memory));
        let allocator: Arc<dyn Allocator> = Arc::new(HeapArena::new(Arc::clone(&stats)));
        let codec = codec_for(config.codec);
        Ok(Self {
            config,
            allocator,
            codec,
            stats,
        })
    }

    pub fn external_threshold(&self) -> usize {
        self.config.external_threshold()
    }

    /// Copy bytes into a fresh external region
    pub fn store_external(&self, bytes: &[u8]) -> Result<Address> {
        let address = self.allocator.allocate(bytes.len())?;
        if let Err(e) = self.allocator.write(address, 0, bytes) {
            let _ = self.allocator.free(address);
            return Err(e);
        }
        self.stats.add_external(bytes.len());
        Ok(address)
    }

    /// Free an external region created by `store_external`
    pub fn free_external(&self, address: Address) -> Result<()> {
        let size = self.allocator.free(address)?;
        self.stats.sub_external(size);
        Ok(())
    }
}
