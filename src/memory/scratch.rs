//! Thread-local scratch buffers
//!
//! Each thread keeps a stack of reusable byte buffers. A call pops one (or
//! creates it), hands it to the closure, and pushes it back afterwards, so
//! nested calls get distinct buffers. Buffers only ever grow.

use std::cell::RefCell;

thread_local! {
    static POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with an empty buffer holding at least `capacity` bytes of room
pub fn with_scratch<R>(capacity: usize, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    let mut buf = POOL.with(|pool| pool.borrow_mut().pop()).unwrap_or_default();
    buf.clear();
    buf.reserve(capacity);
    let result = f(&mut buf);
    POOL.with(|pool| pool.borrow_mut().push(buf));
    result
}
