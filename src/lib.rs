//! # BasaltKV
//!
//! An in-process, off-heap sorted key-value engine with:
//! - Two-level block storage (index blocks directing data blocks)
//! - Byte-balanced block splits, underflow merges and compaction
//! - Optional per-block compression (LZ4 / Zstd)
//! - Optimistic structural retry plus striped per-key locking
//! - Redis-style list encoding built as a chain of segments
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Data Types (Lists / Strings)                    │
//! │        derived key → key lock → map operations               │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    SortedMap                                 │
//! │     (skip list of index blocks, structural retry loop)       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ IndexBlock  │ ──────── │ IndexBlock  │   (RwLock each)
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ DataBlocks  │          │ DataBlocks  │   (sorted records)
//!   └──────┬──────┘          └─────────────┘
//!          │
//!          ▼
//!   ┌─────────────┐
//!   │  HeapArena  │   (external keys/values, list segments)
//!   └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod memory;
pub mod codec;
pub mod block;
pub mod map;
pub mod locker;
pub mod types;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{BasaltError, Result};
pub use config::Config;
pub use block::Entry;
pub use map::{PutOptions, ScanMode, Scanner, SortedMap};
pub use locker::KeyLocker;
pub use types::list::{InsertPosition, ListEnd, Lists, LposOptions};
pub use types::strings::Strings;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of BasaltKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
