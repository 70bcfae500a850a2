//! String values
//!
//! Plain records under `TYPE_STRING` storage keys. Expiry is stored with the
//! record and enforced lazily: an expired value reads as absent and is
//! removed by the read that notices it. Counters and conditional writes run
//! as `Operation`s, so each is atomic against its record.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::block::Entry;
use crate::error::{BasaltError, Result};
use crate::map::{Mutation, Operation, PutOptions, SortedMap};
use crate::memory::with_scratch;
use crate::types::key::{encode_key_into, encoded_len, TYPE_STRING};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn is_live(entry: &Entry, now: u64) -> bool {
    entry.expire.map_or(true, |at| at > now)
}

fn with_string_key<R>(key: &[u8], f: impl FnOnce(&[u8]) -> R) -> R {
    with_scratch(encoded_len(key, &[]), |buf| {
        encode_key_into(buf, TYPE_STRING, key, &[]);
        f(buf)
    })
}

// ============================================================================
// Operations
// ============================================================================

/// Put only when no live value exists
struct SetIfAbsent<'k> {
    key: &'k [u8],
    value: &'k [u8],
    now: u64,
    mutation: Mutation,
}

impl Operation for SetIfAbsent<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        if found.is_some_and(|e| is_live(e, self.now)) {
            return false;
        }
        self.mutation = Mutation::Put {
            value: self.value.to_vec(),
            expire: None,
            custom: false,
        };
        true
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.mutation = Mutation::None;
    }
}

/// Delete the record only if it has expired
struct RemoveExpired<'k> {
    key: &'k [u8],
    now: u64,
    mutation: Mutation,
}

impl Operation for RemoveExpired<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        match found {
            Some(entry) if !is_live(entry, self.now) => {
                self.mutation = Mutation::Delete;
                true
            }
            _ => false,
        }
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.mutation = Mutation::None;
    }
}

/// Replace the value and hand back the previous live one
struct GetSet<'k> {
    key: &'k [u8],
    value: &'k [u8],
    now: u64,
    previous: Option<Vec<u8>>,
    mutation: Mutation,
}

impl Operation for GetSet<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        self.previous = found
            .filter(|e| is_live(e, self.now))
            .map(|e| e.value.clone());
        self.mutation = Mutation::Put {
            value: self.value.to_vec(),
            expire: None,
            custom: false,
        };
        true
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.previous = None;
        self.mutation = Mutation::None;
    }
}

/// Append to the live value, keeping its expiry
struct Append<'k> {
    key: &'k [u8],
    suffix: &'k [u8],
    now: u64,
    length: usize,
    mutation: Mutation,
}

impl Operation for Append<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        let (mut value, expire) = match found.filter(|e| is_live(e, self.now)) {
            Some(entry) => (entry.value.clone(), entry.expire),
            None => (Vec::new(), None),
        };
        value.extend_from_slice(self.suffix);
        self.length = value.len();
        self.mutation = Mutation::Put {
            value,
            expire,
            custom: false,
        };
        true
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.length = 0;
        self.mutation = Mutation::None;
    }
}

/// Add `delta` to a decimal integer value; absent counts as zero
struct IncrBy<'k> {
    key: &'k [u8],
    delta: i64,
    now: u64,
    outcome: Option<std::result::Result<i64, String>>,
    mutation: Mutation,
}

impl IncrBy<'_> {
    fn apply(&self, found: Option<&Entry>) -> std::result::Result<(i64, Option<u64>), String> {
        let Some(entry) = found.filter(|e| is_live(e, self.now)) else {
            return Ok((self.delta, None));
        };
        let current = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| "value is not an integer or out of range".to_string())?;
        let next = current
            .checked_add(self.delta)
            .ok_or_else(|| "increment or decrement would overflow".to_string())?;
        Ok((next, entry.expire))
    }
}

impl Operation for IncrBy<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        match self.apply(found) {
            Ok((next, expire)) => {
                self.mutation = Mutation::Put {
                    value: next.to_string().into_bytes(),
                    expire,
                    custom: false,
                };
                self.outcome = Some(Ok(next));
                true
            }
            Err(reason) => {
                self.outcome = Some(Err(reason));
                false
            }
        }
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.outcome = None;
        self.mutation = Mutation::None;
    }
}

// ============================================================================
// Commands
// ============================================================================

/// String commands over a sorted map
#[derive(Debug, Clone, Copy)]
pub struct Strings<'a> {
    map: &'a SortedMap,
}

impl<'a> Strings<'a> {
    pub fn new(map: &'a SortedMap) -> Self {
        Self { map }
    }

    /// Store `value`, clearing any expiry. Returns false when memory is exhausted.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        with_string_key(key, |skey| self.map.put(skey, value))
    }

    /// Store `value` expiring `ttl` from now
    pub fn set_ex(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<bool> {
        let expire = now_ms().saturating_add(ttl.as_millis() as u64);
        with_string_key(key, |skey| {
            self.map.put_with_options(
                skey,
                value,
                PutOptions {
                    expire: Some(expire),
                    custom: false,
                },
            )
        })
    }

    /// Store only if the key holds no live value
    pub fn setnx(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        with_string_key(key, |skey| {
            let mut op = SetIfAbsent {
                key: skey,
                value,
                now: now_ms(),
                mutation: Mutation::None,
            };
            self.map.execute(&mut op)
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        with_string_key(key, |skey| {
            let Some(entry) = self.map.get_entry(skey)? else {
                return Ok(None);
            };
            let now = now_ms();
            if is_live(&entry, now) {
                return Ok(Some(entry.value));
            }
            let mut op = RemoveExpired {
                key: skey,
                now,
                mutation: Mutation::None,
            };
            self.map.execute(&mut op)?;
            Ok(None)
        })
    }

    /// Absolute expiry of a live value, in milliseconds since the epoch
    pub fn expire_at(&self, key: &[u8]) -> Result<Option<u64>> {
        with_string_key(key, |skey| {
            Ok(self
                .map
                .get_entry(skey)?
                .filter(|e| is_live(e, now_ms()))
                .and_then(|e| e.expire))
        })
    }

    pub fn getset(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        with_string_key(key, |skey| {
            let mut op = GetSet {
                key: skey,
                value,
                now: now_ms(),
                previous: None,
                mutation: Mutation::None,
            };
            self.map.execute(&mut op)?;
            Ok(op.previous)
        })
    }

    /// Append `suffix`, returning the new length
    pub fn append(&self, key: &[u8], suffix: &[u8]) -> Result<usize> {
        with_string_key(key, |skey| {
            let mut op = Append {
                key: skey,
                suffix,
                now: now_ms(),
                length: 0,
                mutation: Mutation::None,
            };
            self.map.execute(&mut op)?;
            Ok(op.length)
        })
    }

    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        with_string_key(key, |skey| {
            let mut op = IncrBy {
                key: skey,
                delta,
                now: now_ms(),
                outcome: None,
                mutation: Mutation::None,
            };
            self.map.execute(&mut op)?;
            match op.outcome {
                Some(Ok(value)) => Ok(value),
                Some(Err(reason)) => Err(BasaltError::InvalidValue(reason)),
                None => Err(BasaltError::Internal("increment did not run".to_string())),
            }
        })
    }

    pub fn decr_by(&self, key: &[u8], delta: i64) -> Result<i64> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| BasaltError::InvalidValue("decrement would overflow".to_string()))?;
        self.incr_by(key, delta)
    }

    pub fn strlen(&self, key: &[u8]) -> Result<usize> {
        Ok(self.get(key)?.map_or(0, |v| v.len()))
    }

    pub fn del(&self, key: &[u8]) -> Result<bool> {
        with_string_key(key, |skey| self.map.delete(skey))
    }
}
