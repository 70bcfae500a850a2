//! Key striping lock manager
//!
//! Logical per-key locks for multi-step data-type operations. Keys hash onto
//! a fixed set of `RwLock<()>` stripes; distinct keys may share a stripe.
//!
//! ## Ordering
//! - Take key locks before touching the map (index block locks come second)
//! - Multi-key variants lock stripes in ascending stripe order, once each
//! - Locks are not reentrant: never lock a key already held on this thread
//!
//! Guards release on drop, on every exit path.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
pub struct KeyLocker {
    stripes: Box<[RwLock<()>]>,
}

/// Shared lock on one key
#[must_use = "the key is unlocked when the guard is dropped"]
pub struct KeyReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive lock on one key
#[must_use = "the key is unlocked when the guard is dropped"]
pub struct KeyWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Shared locks on a set of keys
#[must_use = "the keys are unlocked when the guard is dropped"]
pub struct MultiReadGuard<'a> {
    _guards: Vec<RwLockReadGuard<'a, ()>>,
}

/// Exclusive locks on a set of keys
#[must_use = "the keys are unlocked when the guard is dropped"]
pub struct MultiWriteGuard<'a> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
}

impl KeyReadGuard<'_> {
    pub fn unlock(self) {}
}

impl KeyWriteGuard<'_> {
    pub fn unlock(self) {}
}

impl MultiReadGuard<'_> {
    pub fn unlock(self) {}
}

impl MultiWriteGuard<'_> {
    pub fn unlock(self) {}
}

impl KeyLocker {
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1))
            .map(|_| RwLock::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe guarding `key`
    pub fn stripe_of(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.stripes.len()
    }

    pub fn read_lock(&self, key: &[u8]) -> KeyReadGuard<'_> {
        KeyReadGuard {
            _guard: self.stripes[self.stripe_of(key)].read(),
        }
    }

    pub fn write_lock(&self, key: &[u8]) -> KeyWriteGuard<'_> {
        KeyWriteGuard {
            _guard: self.stripes[self.stripe_of(key)].write(),
        }
    }

    /// Exclusive lock without waiting
    pub fn try_write_lock(&self, key: &[u8]) -> Option<KeyWriteGuard<'_>> {
        self.stripes[self.stripe_of(key)]
            .try_write()
            .map(|guard| KeyWriteGuard { _guard: guard })
    }

    fn ordered_stripes(&self, keys: &[&[u8]]) -> Vec<usize> {
        let mut stripes: Vec<usize> = keys.iter().map(|k| self.stripe_of(k)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes
    }

    pub fn read_lock_all(&self, keys: &[&[u8]]) -> MultiReadGuard<'_> {
        MultiReadGuard {
            _guards: self
                .ordered_stripes(keys)
                .into_iter()
                .map(|s| self.stripes[s].read())
                .collect(),
        }
    }

    pub fn write_lock_all(&self, keys: &[&[u8]]) -> MultiWriteGuard<'_> {
        MultiWriteGuard {
            _guards: self
                .ordered_stripes(keys)
                .into_iter()
                .map(|s| self.stripes[s].write())
                .collect(),
        }
    }
}
