//! Snapshot and load
//!
//! File layout:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Magic "BSNP" (4) │ Version u16 │ Header len u32 │ Header      │
//! │                  │             │                │ (bincode)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record: [tag u8][flags u8][key_len u32][value_len u32]       │
//! │         [expire u64][key][payload]                           │
//! │ Record: ...                                                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ End marker 0xFF │ Record count u64 │ CRC32 of records u32     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Plain records carry their value as payload. Composite records (lists)
//! carry the output of their type's serializer, which rebuilds the external
//! structure on load. All integers are little-endian.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::Bound;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PutOptions, SortedMap};
use crate::block::record::{Placement, FLAG_CUSTOM_TYPE, FLAG_HAS_EXPIRE};
use crate::codec::CodecType;
use crate::config::Config;
use crate::error::{BasaltError, Result};
use crate::types::CustomType;

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE: &str = "sortedmap.snapshot";

const MAGIC: &[u8; 4] = b"BSNP";
const VERSION: u16 = 1;

const RECORD_PLAIN: u8 = 0x00;
const RECORD_CUSTOM: u8 = 0x01;
const END_MARKER: u8 = 0xFF;

/// tag + flags + key_len + value_len + expire
const RECORD_PREFIX_SIZE: usize = 1 + 1 + 4 + 4 + 8;

/// end marker + count + crc
const FOOTER_SIZE: usize = 1 + 8 + 4;

/// Descriptive header written after the magic and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub created_at_ms: u64,
    pub codec: CodecType,
    pub max_block_size: u32,
    pub record_count: u64,
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(BasaltError::SnapshotCorruption(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn encode_record(buf: &mut Vec<u8>, tag: u8, key: &[u8], payload: &[u8], expire: Option<u64>, threshold: usize) {
    let mut flags = Placement::for_record(key.len(), payload.len(), expire.is_some(), threshold).flags();
    if tag == RECORD_CUSTOM {
        flags |= FLAG_CUSTOM_TYPE;
    }
    if expire.is_some() {
        flags |= FLAG_HAS_EXPIRE;
    }
    buf.put_u8(tag);
    buf.put_u8(flags);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u64_le(expire.unwrap_or(0));
    buf.put_slice(key);
    buf.put_slice(payload);
}

impl SortedMap {
    /// Location of the snapshot file for this map's configuration
    pub fn snapshot_path(&self) -> PathBuf {
        self.config().data_dir.join(SNAPSHOT_FILE)
    }

    /// Write every record to the snapshot file, returning the record count.
    ///
    /// Plain records come from one consistent copy of the map. Each composite
    /// value is then re-read and serialized under its key's read lock, so the
    /// caller must not hold a key lock on this thread.
    pub fn snapshot(&self) -> Result<u64> {
        self.check_open()?;
        let dir = &self.config().data_dir;
        fs::create_dir_all(dir)?;
        let path = self.snapshot_path();
        let tmp = path.with_extension("snapshot.tmp");

        let entries = self.snapshot_range(Bound::Unbounded, Bound::Unbounded)?;
        let threshold = self.ctx.external_threshold();

        let mut body = Vec::new();
        let mut count = 0u64;
        for entry in entries {
            let custom_type = if entry.custom {
                CustomType::from_key(&entry.key)
            } else {
                None
            };
            match custom_type {
                Some(ty) => {
                    let _guard = self.locker.read_lock(&entry.key);
                    let current = match self.get_entry(&entry.key)? {
                        Some(current) if current.custom => current,
                        _ => continue,
                    };
                    let payload = ty.serialize(&self.ctx, &current.value)?;
                    encode_record(&mut body, RECORD_CUSTOM, &entry.key, &payload, current.expire, threshold);
                }
                None => {
                    encode_record(&mut body, RECORD_PLAIN, &entry.key, &entry.value, entry.expire, threshold);
                }
            }
            count += 1;
        }

        let header = SnapshotHeader {
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            codec: self.config().codec,
            max_block_size: self.config().max_block_size as u32,
            record_count: count,
        };
        let header_bytes = bincode::serialize(&header)?;

        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&header_bytes)?;
        writer.write_all(&body)?;
        writer.write_all(&[END_MARKER])?;
        writer.write_all(&count.to_le_bytes())?;
        writer.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp, &path)?;

        info!(records = count, bytes = body.len(), path = %path.display(), "snapshot written");
        Ok(count)
    }

    /// Open a map from the snapshot in `config.data_dir`, or empty if none exists
    pub fn load(config: Config) -> Result<SortedMap> {
        let map = SortedMap::new(config)?;
        let path = map.snapshot_path();
        if !path.exists() {
            info!(path = %path.display(), "no snapshot found, starting empty");
            return Ok(map);
        }
        let data = fs::read(&path)?;
        let loaded = map.restore(&data)?;
        info!(records = loaded, path = %path.display(), "snapshot loaded");
        Ok(map)
    }

    fn restore(&self, data: &[u8]) -> Result<u64> {
        let mut buf = data;
        ensure(buf, MAGIC.len() + 2 + 4, "preamble")?;
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(BasaltError::SnapshotCorruption("bad magic".to_string()));
        }
        buf.advance(MAGIC.len());
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(BasaltError::SnapshotCorruption(format!(
                "unsupported version {}",
                version
            )));
        }
        let header_len = buf.get_u32_le() as usize;
        ensure(buf, header_len, "header")?;
        let header: SnapshotHeader = bincode::deserialize(&buf[..header_len])?;
        buf.advance(header_len);
        debug!(?header, "snapshot header");

        ensure(buf, FOOTER_SIZE, "footer")?;
        let (mut body, mut footer) = buf.split_at(buf.len() - FOOTER_SIZE);
        if footer.get_u8() != END_MARKER {
            return Err(BasaltError::SnapshotCorruption("missing end marker".to_string()));
        }
        let stored_count = footer.get_u64_le();
        let stored_crc = footer.get_u32_le();
        if crc32fast::hash(body) != stored_crc {
            return Err(BasaltError::SnapshotCorruption("checksum mismatch".to_string()));
        }
        if stored_count != header.record_count {
            return Err(BasaltError::SnapshotCorruption(format!(
                "record count {} disagrees with header {}",
                stored_count, header.record_count
            )));
        }

        let mut count = 0u64;
        while body.has_remaining() {
            ensure(body, RECORD_PREFIX_SIZE, "record prefix")?;
            let tag = body.get_u8();
            let flags = body.get_u8();
            let key_len = body.get_u32_le() as usize;
            let payload_len = body.get_u32_le() as usize;
            let expire = body.get_u64_le();
            ensure(body, key_len + payload_len, "record body")?;
            let key = &body[..key_len];
            let payload = &body[key_len..key_len + payload_len];
            body.advance(key_len + payload_len);

            let expire = (flags & FLAG_HAS_EXPIRE != 0).then_some(expire);
            let stored = match tag {
                RECORD_PLAIN => self.put_with_options(key, payload, PutOptions { expire, custom: false })?,
                RECORD_CUSTOM => {
                    let ty = CustomType::from_key(key).ok_or_else(|| {
                        BasaltError::SnapshotCorruption("composite record with unknown type".to_string())
                    })?;
                    let value = ty.deserialize(&self.ctx, payload)?;
                    self.put_with_options(key, &value, PutOptions { expire, custom: true })?
                }
                other => {
                    return Err(BasaltError::SnapshotCorruption(format!("unknown record tag {:#x}", other)))
                }
            };
            if !stored {
                return Err(BasaltError::OutOfMemory {
                    requested: key_len + payload_len,
                    limit: self.ctx.stats.limit(),
                });
            }
            count += 1;
        }
        if count != stored_count {
            return Err(BasaltError::SnapshotCorruption(format!(
                "read {} records, footer says {}",
                count, stored_count
            )));
        }
        Ok(count)
    }
}
