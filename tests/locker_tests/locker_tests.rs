//! Tests for KeyLocker
//!
//! These tests verify:
//! - Keys map to stable stripes
//! - Readers share a key, writers exclude everyone
//! - Multi-key locking dedupes stripes and avoids deadlock
//! - Guards release on drop and on explicit unlock

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use basaltkv::KeyLocker;

// =============================================================================
// Stripe Tests
// =============================================================================

#[test]
fn test_stripes_are_stable() {
    let locker = KeyLocker::new(64);

    assert_eq!(locker.stripe_count(), 64);
    assert_eq!(locker.stripe_of(b"alpha"), locker.stripe_of(b"alpha"));
    assert!(locker.stripe_of(b"beta") < 64);
}

#[test]
fn test_zero_stripes_means_one() {
    let locker = KeyLocker::new(0);

    assert_eq!(locker.stripe_count(), 1);
    assert_eq!(locker.stripe_of(b"a"), locker.stripe_of(b"b"));
}

// =============================================================================
// Exclusion Tests
// =============================================================================

#[test]
fn test_readers_share_writers_exclude() {
    let locker = KeyLocker::new(16);

    let r1 = locker.read_lock(b"k");
    let r2 = locker.read_lock(b"k");
    assert!(locker.try_write_lock(b"k").is_none());

    r1.unlock();
    assert!(locker.try_write_lock(b"k").is_none());
    drop(r2);

    let w = locker.try_write_lock(b"k").unwrap();
    assert!(locker.try_write_lock(b"k").is_none());
    w.unlock();
    assert!(locker.try_write_lock(b"k").is_some());
}

#[test]
fn test_write_lock_serializes_read_modify_write() {
    let locker = Arc::new(KeyLocker::new(8));
    let counter = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let (locker, counter) = (Arc::clone(&locker), Arc::clone(&counter));
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                let _guard = locker.write_lock(b"counter");
                // non-atomic increment made safe only by the key lock
                let current = counter.load(Ordering::Relaxed);
                counter.store(current + 1, Ordering::Relaxed);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 2000);
}

// =============================================================================
// Multi-Key Tests
// =============================================================================

#[test]
fn test_lock_all_dedupes_shared_stripes() {
    // every key shares the only stripe
    let locker = KeyLocker::new(1);

    let guard = locker.write_lock_all(&[&b"a"[..], &b"b"[..], &b"a"[..]]);
    assert!(locker.try_write_lock(b"c").is_none());
    guard.unlock();

    let read = locker.read_lock_all(&[&b"a"[..], &b"b"[..]]);
    assert!(locker.try_write_lock(b"a").is_none());
    drop(read);
    assert!(locker.try_write_lock(b"a").is_some());
}

#[test]
fn test_opposite_order_multi_locks_do_not_deadlock() {
    let locker = Arc::new(KeyLocker::new(256));
    let mut handles = Vec::new();

    for t in 0..4 {
        let locker = Arc::clone(&locker);
        handles.push(thread::spawn(move || {
            for i in 0..500 {
                let (a, b) = (format!("key-{}", i % 7), format!("key-{}", (i + 3) % 7));
                let keys: [&[u8]; 2] = if t % 2 == 0 {
                    [a.as_bytes(), b.as_bytes()]
                } else {
                    [b.as_bytes(), a.as_bytes()]
                };
                let _guard = locker.write_lock_all(&keys);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_writer_waits_for_reader() {
    let locker = Arc::new(KeyLocker::new(4));
    let acquired = Arc::new(AtomicUsize::new(0));

    let reader = locker.read_lock(b"shared");
    let writer = {
        let (locker, acquired) = (Arc::clone(&locker), Arc::clone(&acquired));
        thread::spawn(move || {
            let _guard = locker.write_lock(b"shared");
            acquired.store(1, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(acquired.load(Ordering::SeqCst), 0);
    drop(reader);
    writer.join().unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), 1);
}
