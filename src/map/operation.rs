//! Read-modify-write operations
//!
//! An `Operation` is handed the record currently stored under its key (if
//! any) and decides on at most one resulting mutation. The map runs it under
//! the index block lock, so the read and the write are atomic with respect to
//! structural changes. A structural retry calls `reset` and runs it again.

use crate::block::Entry;

/// The single mutation an operation may request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Mutation {
    #[default]
    None,
    Put {
        value: Vec<u8>,
        expire: Option<u64>,
        custom: bool,
    },
    Delete,
}

/// Caller-supplied read-modify-write unit
pub trait Operation {
    /// Key the operation targets
    fn key(&self) -> &[u8];

    /// Read-only operations run under a shared lock and never mutate
    fn is_read_only(&self) -> bool {
        false
    }

    /// Inspect the current record; the return value is passed back to the caller
    fn execute(&mut self, found: Option<&Entry>) -> bool;

    /// Mutation decided by the last `execute`
    fn take_mutation(&mut self) -> Mutation {
        Mutation::None
    }

    /// Forget state from an attempt that is about to be retried
    fn reset(&mut self) {}
}
