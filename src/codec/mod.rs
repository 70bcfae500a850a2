//! Codec Module
//!
//! Block compression capability.
//!
//! ## Responsibilities
//! - Identify codecs by a one-byte tag (persisted in snapshots)
//! - Compress a byte range and restore it byte-for-byte given its length
//!
//! ## Codecs
//! ```text
//! tag  codec   backend
//! 0    None    identity
//! 1    Lz4     lz4_flex block format
//! 2    Zstd    zstd bulk API, level 3
//! ```

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BasaltError, Result};

const ZSTD_LEVEL: i32 = 3;

/// Codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecType {
    #[default]
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CodecType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CodecType {
    type Error = BasaltError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CodecType::None),
            1 => Ok(CodecType::Lz4),
            2 => Ok(CodecType::Zstd),
            other => Err(BasaltError::Codec(format!("unknown codec tag {}", other))),
        }
    }
}

impl FromStr for CodecType {
    type Err = BasaltError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CodecType::None),
            "lz4" => Ok(CodecType::Lz4),
            "zstd" => Ok(CodecType::Zstd),
            other => Err(BasaltError::Config(format!("unknown codec '{}'", other))),
        }
    }
}

/// Compression capability
pub trait Codec: Send + Sync + Debug {
    fn codec_type(&self) -> CodecType;

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Restore exactly `expected_len` bytes
    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// Resolve the implementation for a codec tag
pub fn codec_for(codec: CodecType) -> Arc<dyn Codec> {
    match codec {
        CodecType::None => Arc::new(NoneCodec),
        CodecType::Lz4 => Arc::new(Lz4Codec),
        CodecType::Zstd => Arc::new(ZstdCodec { level: ZSTD_LEVEL }),
    }
}

fn check_len(out: Vec<u8>, expected_len: usize) -> Result<Vec<u8>> {
    if out.len() != expected_len {
        return Err(BasaltError::Codec(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}

#[derive(Debug)]
struct NoneCodec;

impl Codec for NoneCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::None
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        Ok(src.to_vec())
    }

    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        check_len(src.to_vec(), expected_len)
    }
}

#[derive(Debug)]
struct Lz4Codec;

impl Codec for Lz4Codec {
    fn codec_type(&self) -> CodecType {
        CodecType::Lz4
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(src))
    }

    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = lz4_flex::block::decompress(src, expected_len)
            .map_err(|e| BasaltError::Codec(e.to_string()))?;
        check_len(out, expected_len)
    }
}

#[derive(Debug)]
struct ZstdCodec {
    level: i32,
}

impl Codec for ZstdCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Zstd
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(src, self.level).map_err(|e| BasaltError::Codec(e.to_string()))
    }

    fn decompress(&self, src: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = zstd::bulk::decompress(src, expected_len)
            .map_err(|e| BasaltError::Codec(e.to_string()))?;
        check_len(out, expected_len)
    }
}
