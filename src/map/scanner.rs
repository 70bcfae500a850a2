//! Map scanners
//!
//! Cursors over `[start, stop)` in ascending (forward) or descending
//! (reverse) key order. An empty bound is unbounded on that side.
//!
//! ## Modes
//! - `Live`: copies one data block's worth of records at a time under that
//!   index block's shared lock, then lets go. Blocks not yet visited reflect
//!   concurrent changes.
//! - `Safe`: locks every overlapping index block (ascending order), copies
//!   the whole range, then lets go. The scan sees a single point in time.
//!
//! Both modes move through the same position model:
//! ```text
//!   Low ◄── step down ── At(key) ── step up ──► High
//! ```
//! A forward scanner starts at `Low` and ends at `High`; a reverse scanner
//! the other way round.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock};

use super::{Attempt, SortedMap};
use crate::block::{Entry, IndexBlock, ScanState};
use crate::error::Result;

/// Isolation level of a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    Live,
    Safe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Low,
    At(Vec<u8>),
    High,
}

/// Records copied from one data block, covering `[lo, hi]` of the key space
#[derive(Debug)]
struct Window {
    entries: Vec<Entry>,
    lo: Bound<Vec<u8>>,
    hi: Bound<Vec<u8>>,
}

#[derive(Debug)]
enum Source {
    Live(Option<Window>),
    Safe(Vec<Entry>),
}

/// Cursor over a key range of a `SortedMap`
#[derive(Debug)]
pub struct Scanner<'a> {
    map: &'a SortedMap,
    start: Vec<u8>,
    stop: Vec<u8>,
    reverse: bool,
    source: Source,
    position: Position,
    /// Lookahead computed by `has_next`
    pending: Option<(Option<Entry>, Position)>,
}

fn satisfies_from(key: &[u8], from: Bound<&[u8]>) -> bool {
    match from {
        Bound::Unbounded => true,
        Bound::Included(k) => key >= k,
        Bound::Excluded(k) => key > k,
    }
}

fn satisfies_to(key: &[u8], to: Bound<&[u8]>) -> bool {
    match to {
        Bound::Unbounded => true,
        Bound::Included(k) => key <= k,
        Bound::Excluded(k) => key < k,
    }
}

/// Whether a window whose lower edge is `lo` holds everything from `from` upward
fn lower_covers(lo: &Bound<Vec<u8>>, from: Bound<&[u8]>) -> bool {
    match (lo, from) {
        (Bound::Unbounded, _) => true,
        (_, Bound::Unbounded) => false,
        (Bound::Included(l), Bound::Included(k) | Bound::Excluded(k)) => k >= l.as_slice(),
        (Bound::Excluded(l), Bound::Included(k)) => k > l.as_slice(),
        (Bound::Excluded(l), Bound::Excluded(k)) => k >= l.as_slice(),
    }
}

/// Whether a window whose upper edge is `hi` holds everything below `to`
fn upper_covers(hi: &Bound<Vec<u8>>, to: Bound<&[u8]>) -> bool {
    match (hi, to) {
        (Bound::Unbounded, _) => true,
        (_, Bound::Unbounded) => false,
        (Bound::Included(h) | Bound::Excluded(h), Bound::Excluded(k)) => k <= h.as_slice(),
        (Bound::Included(h), Bound::Included(k)) => k <= h.as_slice(),
        (Bound::Excluded(h), Bound::Included(k)) => k < h.as_slice(),
    }
}

fn to_owned_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(k.to_vec()),
        Bound::Excluded(k) => Bound::Excluded(k.to_vec()),
    }
}

fn as_ref_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
    }
}

impl<'a> Scanner<'a> {
    fn open(map: &'a SortedMap, start: &[u8], stop: &[u8], mode: ScanMode, reverse: bool) -> Result<Self> {
        let mut scanner = Self {
            map,
            start: start.to_vec(),
            stop: stop.to_vec(),
            reverse,
            source: Source::Live(None),
            position: if reverse { Position::High } else { Position::Low },
            pending: None,
        };
        if mode == ScanMode::Safe {
            let entries = map.snapshot_range(scanner.start_bound(), scanner.stop_bound())?;
            scanner.source = Source::Safe(entries);
        }
        Ok(scanner)
    }

    fn start_bound(&self) -> Bound<&[u8]> {
        if self.start.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(self.start.as_slice())
        }
    }

    fn stop_bound(&self) -> Bound<&[u8]> {
        if self.stop.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(self.stop.as_slice())
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Where the cursor stands relative to its own direction
    pub fn state(&self) -> ScanState {
        match (&self.position, self.reverse) {
            (Position::At(_), _) => ScanState::Positioned,
            (Position::Low, false) | (Position::High, true) => ScanState::BeforeFirst,
            (Position::High, false) | (Position::Low, true) => ScanState::Exhausted,
        }
    }

    /// Whether `next_record` would return a record
    pub fn has_next(&mut self) -> Result<bool> {
        if self.pending.is_none() {
            let up = !self.reverse;
            let position = self.position.clone();
            self.pending = Some(self.step(&position, up)?);
        }
        Ok(matches!(self.pending, Some((Some(_), _))))
    }

    /// Advance in scan direction
    pub fn next_record(&mut self) -> Result<Option<Entry>> {
        if let Some((entry, position)) = self.pending.take() {
            self.position = position;
            return Ok(entry);
        }
        let up = !self.reverse;
        self.advance(up)
    }

    /// Move back against scan direction
    pub fn previous_record(&mut self) -> Result<Option<Entry>> {
        self.pending = None;
        let up = self.reverse;
        self.advance(up)
    }

    /// Seek to the final record in scan direction
    pub fn last_record(&mut self) -> Result<Option<Entry>> {
        self.pending = None;
        self.position = if self.reverse { Position::Low } else { Position::High };
        let up = self.reverse;
        self.advance(up)
    }

    fn advance(&mut self, up: bool) -> Result<Option<Entry>> {
        let position = self.position.clone();
        let (entry, position) = self.step(&position, up)?;
        self.position = position;
        Ok(entry)
    }

    /// Neighbour of `position` in key order, and the position after moving
    fn step(&mut self, position: &Position, up: bool) -> Result<(Option<Entry>, Position)> {
        if up {
            let found = match position {
                Position::High => return Ok((None, Position::High)),
                Position::Low => self.successor(self.owned_start_bound())?,
                Position::At(key) => self.successor(Bound::Excluded(key.clone()))?,
            };
            let found = found.filter(|e| satisfies_to(&e.key, self.stop_bound()));
            Ok(match found {
                Some(e) => {
                    let at = Position::At(e.key.clone());
                    (Some(e), at)
                }
                None => (None, Position::High),
            })
        } else {
            let found = match position {
                Position::Low => return Ok((None, Position::Low)),
                Position::High => self.predecessor(self.owned_stop_bound())?,
                Position::At(key) => self.predecessor(Bound::Excluded(key.clone()))?,
            };
            let found = found.filter(|e| satisfies_from(&e.key, self.start_bound()));
            Ok(match found {
                Some(e) => {
                    let at = Position::At(e.key.clone());
                    (Some(e), at)
                }
                None => (None, Position::Low),
            })
        }
    }

    fn owned_start_bound(&self) -> Bound<Vec<u8>> {
        to_owned_bound(self.start_bound())
    }

    fn owned_stop_bound(&self) -> Bound<Vec<u8>> {
        to_owned_bound(self.stop_bound())
    }

    /// Smallest record satisfying `from`
    fn successor(&mut self, from: Bound<Vec<u8>>) -> Result<Option<Entry>> {
        let from = as_ref_bound(&from);
        match &mut self.source {
            Source::Safe(entries) => {
                let idx = entries.partition_point(|e| !satisfies_from(&e.key, from));
                Ok(entries.get(idx).cloned())
            }
            Source::Live(window) => {
                if let Some(w) = window.as_ref() {
                    if lower_covers(&w.lo, from) {
                        if let Some(e) = w.entries.iter().find(|e| satisfies_from(&e.key, from)) {
                            return Ok(Some(e.clone()));
                        }
                    }
                }
                let fetched = self.map.window_after(from)?;
                let first = fetched.as_ref().and_then(|w| w.entries.first().cloned());
                *window = fetched;
                Ok(first)
            }
        }
    }

    /// Largest record satisfying `to`
    fn predecessor(&mut self, to: Bound<Vec<u8>>) -> Result<Option<Entry>> {
        let to = as_ref_bound(&to);
        match &mut self.source {
            Source::Safe(entries) => {
                let idx = entries.partition_point(|e| satisfies_to(&e.key, to));
                Ok(idx.checked_sub(1).map(|i| entries[i].clone()))
            }
            Source::Live(window) => {
                if let Some(w) = window.as_ref() {
                    if upper_covers(&w.hi, to) {
                        if let Some(e) = w.entries.iter().rev().find(|e| satisfies_to(&e.key, to)) {
                            return Ok(Some(e.clone()));
                        }
                    }
                }
                let fetched = self.map.window_before(to)?;
                let last = fetched.as_ref().and_then(|w| w.entries.last().cloned());
                *window = fetched;
                Ok(last)
            }
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

// =============================================================================
// Map-side range access
// =============================================================================

impl SortedMap {
    /// Ascending scanner over `[start, stop)`
    pub fn scanner(&self, start: &[u8], stop: &[u8], mode: ScanMode) -> Result<Scanner<'_>> {
        self.check_open()?;
        Scanner::open(self, start, stop, mode, false)
    }

    /// Descending scanner over `[start, stop)`
    pub fn reverse_scanner(&self, start: &[u8], stop: &[u8], mode: ScanMode) -> Result<Scanner<'_>> {
        self.check_open()?;
        Scanner::open(self, start, stop, mode, true)
    }

    /// Index blocks whose range may overlap `[lower, upper)`, ascending
    fn overlapping_blocks(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<Arc<RwLock<IndexBlock>>> {
        let first_fence: Vec<u8> = match lower {
            Bound::Unbounded => Vec::new(),
            Bound::Included(k) | Bound::Excluded(k) => self
                .index
                .upper_bound(Bound::Included(k))
                .map(|e| e.key().clone())
                .unwrap_or_default(),
        };
        self.index
            .range::<[u8], _>((Bound::Included(first_fence.as_slice()), Bound::Unbounded))
            .take_while(|e| satisfies_to(e.key(), upper) || e.key().as_slice() == first_fence.as_slice())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Consistent copy of every record in the range
    pub(crate) fn snapshot_range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<Vec<Entry>> {
        self.with_retry(|| {
            let blocks = self.overlapping_blocks(lower, upper);
            let guards: Vec<ArcRwLockReadGuard<RawRwLock, IndexBlock>> =
                blocks.iter().map(|b| b.read_arc()).collect();
            let current = self.overlapping_blocks(lower, upper);
            let unchanged = guards.iter().all(|g| g.is_valid())
                && current.len() == blocks.len()
                && current.iter().zip(&blocks).all(|(a, b)| Arc::ptr_eq(a, b));
            if !unchanged {
                return Ok(Attempt::Retry);
            }
            let mut out = Vec::new();
            for guard in &guards {
                out.extend(guard.collect_range(&self.ctx, lower, upper)?);
            }
            Ok(Attempt::Done(out))
        })
    }

    /// Records of the first data block holding anything that satisfies `from`
    fn window_after(&self, from: Bound<&[u8]>) -> Result<Option<Window>> {
        self.with_retry(|| {
            let key: &[u8] = match from {
                Bound::Unbounded => &[],
                Bound::Included(k) | Bound::Excluded(k) => k,
            };
            let mut block = self.locate(key)?;
            {
                let guard = block.read();
                if !self.routes(&block, &guard, key)? {
                    return Ok(Attempt::Retry);
                }
            }
            loop {
                let next = {
                    let guard = block.read();
                    if !guard.is_valid() {
                        return Ok(Attempt::Retry);
                    }
                    if let Some(entries) = guard.collect_after(&self.ctx, from)? {
                        let hi = entries
                            .last()
                            .map_or(Bound::Unbounded, |e| Bound::Included(e.key.clone()));
                        return Ok(Attempt::Done(Some(Window {
                            entries,
                            lo: to_owned_bound(from),
                            hi,
                        })));
                    }
                    self.index
                        .lower_bound(Bound::Excluded(guard.fence()))
                        .map(|e| Arc::clone(e.value()))
                };
                match next {
                    Some(b) => block = b,
                    None => return Ok(Attempt::Done(None)),
                }
            }
        })
    }

    /// Records of the last data block holding anything that satisfies `to`
    fn window_before(&self, to: Bound<&[u8]>) -> Result<Option<Window>> {
        self.with_retry(|| {
            let mut block = match to {
                Bound::Unbounded => match self.index.back() {
                    Some(e) => Arc::clone(e.value()),
                    None => return Ok(Attempt::Done(None)),
                },
                Bound::Included(k) | Bound::Excluded(k) => {
                    let block = self.locate(k)?;
                    let routed = {
                        let guard = block.read();
                        self.routes(&block, &guard, k)?
                    };
                    if !routed {
                        return Ok(Attempt::Retry);
                    }
                    block
                }
            };
            loop {
                let prev = {
                    let guard = block.read();
                    if !guard.is_valid() {
                        return Ok(Attempt::Retry);
                    }
                    if let Some(entries) = guard.collect_before(&self.ctx, to)? {
                        let lo = entries
                            .first()
                            .map_or(Bound::Unbounded, |e| Bound::Included(e.key.clone()));
                        return Ok(Attempt::Done(Some(Window {
                            entries,
                            lo,
                            hi: to_owned_bound(to),
                        })));
                    }
                    if guard.fence().is_empty() {
                        None
                    } else {
                        self.index
                            .upper_bound(Bound::Excluded(guard.fence()))
                            .map(|e| Arc::clone(e.value()))
                    }
                };
                match prev {
                    Some(b) => block = b,
                    None => return Ok(Attempt::Done(None)),
                }
            }
        })
    }
}
