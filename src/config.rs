//! Configuration for BasaltKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::codec::CodecType;
use crate::error::{BasaltError, Result};

/// Smallest size class a data block region can occupy (bytes)
pub const MIN_BLOCK_SIZE: usize = 128;

/// Main configuration for a sorted map instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the snapshot file
    /// Internal structure:
    ///   {data_dir}/
    ///     └── sortedmap.snapshot
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Block Configuration
    // -------------------------------------------------------------------------
    /// Maximum size of a data block record region (bytes)
    pub max_block_size: usize,

    /// Size of an index block entry region (bytes)
    pub max_index_block_size: usize,

    /// Codec applied to data blocks after every mutation
    pub codec: CodecType,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Ceiling on allocated bytes for this instance (0 = unlimited)
    pub max_memory: u64,

    // -------------------------------------------------------------------------
    // Data Type Configuration
    // -------------------------------------------------------------------------
    /// Target maximum size of a list segment, header included (bytes)
    pub list_max_segment_size: usize,

    /// Number of stripes in the key lock manager
    pub key_lock_stripes: usize,

    // -------------------------------------------------------------------------
    // Concurrency Configuration
    // -------------------------------------------------------------------------
    /// Upper bound on structural retries before an operation fails
    pub max_retries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./basalt_data"),
            max_block_size: 4096,
            max_index_block_size: 4096,
            codec: CodecType::None,
            max_memory: 0,
            list_max_segment_size: 4096,
            key_lock_stripes: 1024,
            max_retries: 100_000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Record size above which keys and values leave the block
    pub fn external_threshold(&self) -> usize {
        self.max_block_size / 4
    }

    /// Check that the configured sizes can actually hold records
    pub fn validate(&self) -> Result<()> {
        if self.max_block_size < MIN_BLOCK_SIZE * 2 {
            return Err(BasaltError::Config(format!(
                "max_block_size must be at least {} bytes, got {}",
                MIN_BLOCK_SIZE * 2,
                self.max_block_size
            )));
        }
        if self.max_block_size > u32::MAX as usize {
            return Err(BasaltError::Config(format!(
                "max_block_size too large: {}",
                self.max_block_size
            )));
        }
        // An index block must take at least four maximal entries to split sensibly
        if self.max_index_block_size < 4 * self.external_threshold() {
            return Err(BasaltError::Config(format!(
                "max_index_block_size must be at least {} bytes, got {}",
                4 * self.external_threshold(),
                self.max_index_block_size
            )));
        }
        if self.list_max_segment_size < 64 {
            return Err(BasaltError::Config(format!(
                "list_max_segment_size must be at least 64 bytes, got {}",
                self.list_max_segment_size
            )));
        }
        if self.key_lock_stripes == 0 {
            return Err(BasaltError::Config(
                "key_lock_stripes must be positive".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(BasaltError::Config(
                "max_retries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (where snapshots live)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the maximum data block size (in bytes)
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.config.max_block_size = size;
        self
    }

    /// Set the index block size (in bytes)
    pub fn max_index_block_size(mut self, size: usize) -> Self {
        self.config.max_index_block_size = size;
        self
    }

    /// Set the block compression codec
    pub fn codec(mut self, codec: CodecType) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set the memory ceiling (in bytes, 0 = unlimited)
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the target list segment size (in bytes)
    pub fn list_max_segment_size(mut self, size: usize) -> Self {
        self.config.list_max_segment_size = size;
        self
    }

    /// Set the number of key lock stripes
    pub fn key_lock_stripes(mut self, count: usize) -> Self {
        self.config.key_lock_stripes = count;
        self
    }

    /// Set the structural retry bound
    pub fn max_retries(mut self, count: usize) -> Self {
        self.config.max_retries = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
