//! Data block scanner
//!
//! A cursor over the records copied out of one data block.
//!
//! ```text
//!   BeforeFirst ──next──► Positioned(0) ──next──► ... ──next──► Exhausted
//!        ▲                     │                                    │
//!        └──────previous───────┘       Positioned(n-1) ◄──previous──┘
//! ```

use super::Entry;

/// Cursor position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    BeforeFirst,
    Positioned,
    Exhausted,
}

#[derive(Debug)]
pub struct DataBlockScanner {
    entries: Vec<Entry>,
    /// Index of the current record when positioned
    position: usize,
    state: ScanState,
}

impl DataBlockScanner {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            position: 0,
            state: ScanState::BeforeFirst,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_next(&self) -> bool {
        match self.state {
            ScanState::BeforeFirst => !self.entries.is_empty(),
            ScanState::Positioned => self.position + 1 < self.entries.len(),
            ScanState::Exhausted => false,
        }
    }

    pub fn next(&mut self) -> Option<&Entry> {
        let next = match self.state {
            ScanState::BeforeFirst => 0,
            ScanState::Positioned => self.position + 1,
            ScanState::Exhausted => return None,
        };
        self.move_to(next)
    }

    pub fn previous(&mut self) -> Option<&Entry> {
        match self.state {
            ScanState::BeforeFirst => None,
            ScanState::Positioned if self.position == 0 => {
                self.state = ScanState::BeforeFirst;
                None
            }
            ScanState::Positioned => self.move_to(self.position - 1),
            ScanState::Exhausted => self.last(),
        }
    }

    /// Seek to the final record
    pub fn last(&mut self) -> Option<&Entry> {
        if self.entries.is_empty() {
            self.state = ScanState::Exhausted;
            return None;
        }
        self.move_to(self.entries.len() - 1)
    }

    fn move_to(&mut self, index: usize) -> Option<&Entry> {
        if index >= self.entries.len() {
            self.state = ScanState::Exhausted;
            return None;
        }
        self.position = index;
        self.state = ScanState::Positioned;
        self.entries.get(index)
    }
}
