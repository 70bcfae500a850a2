//! Error types for BasaltKV
//!
//! Provides a unified error type for all operations.
//!
//! Hot-path outcomes (key absent, block full, structural retry) are plain
//! return values and never travel through this type.

use thiserror::Error;

/// Result type alias using BasaltError
pub type Result<T> = std::result::Result<T, BasaltError>;

/// Unified error type for BasaltKV operations
#[derive(Debug, Error)]
pub enum BasaltError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Memory Errors
    // -------------------------------------------------------------------------
    #[error("Out of memory: requested {requested} bytes (limit {limit})")]
    OutOfMemory { requested: usize, limit: u64 },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    #[error("Out of bounds access at {address:#x}: offset {offset}, len {len}")]
    OutOfBounds {
        address: u64,
        offset: usize,
        len: usize,
    },

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Corrupted value: {0}")]
    CorruptedValue(String),

    #[error("Structural retry limit exceeded after {0} attempts")]
    RetryLimitExceeded(usize),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Index out of range")]
    IndexOutOfRange,

    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("Map has been disposed")]
    Disposed,

    #[error("Internal error: {0}")]
    Internal(String),

    // -------------------------------------------------------------------------
    // Snapshot / Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Snapshot corruption detected: {0}")]
    SnapshotCorruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for BasaltError {
    fn from(e: bincode::Error) -> Self {
        BasaltError::Serialization(e.to_string())
    }
}
