//! Tests for string values
//!
//! These tests verify:
//! - SET/GET/DEL and conditional writes
//! - Lazy expiry on read
//! - Counters, APPEND and GETSET as atomic read-modify-write
//! - Concurrent increments lose no updates

use std::thread;
use std::time::Duration;

use basaltkv::{BasaltError, Config, SortedMap, Strings};

// =============================================================================
// Helper Functions
// =============================================================================

fn map() -> SortedMap {
    SortedMap::new(Config::default()).unwrap()
}

// =============================================================================
// Basic Tests
// =============================================================================

#[test]
fn test_set_get_del() {
    let map = map();
    let strings = Strings::new(&map);

    assert!(strings.set(b"greeting", b"hello").unwrap());
    assert_eq!(strings.get(b"greeting").unwrap(), Some(b"hello".to_vec()));
    assert_eq!(strings.strlen(b"greeting").unwrap(), 5);

    assert!(strings.del(b"greeting").unwrap());
    assert!(!strings.del(b"greeting").unwrap());
    assert_eq!(strings.get(b"greeting").unwrap(), None);
    assert_eq!(strings.strlen(b"greeting").unwrap(), 0);
}

#[test]
fn test_setnx() {
    let map = map();
    let strings = Strings::new(&map);

    assert!(strings.setnx(b"lock", b"owner-1").unwrap());
    assert!(!strings.setnx(b"lock", b"owner-2").unwrap());
    assert_eq!(strings.get(b"lock").unwrap(), Some(b"owner-1".to_vec()));
}

#[test]
fn test_getset() {
    let map = map();
    let strings = Strings::new(&map);

    assert_eq!(strings.getset(b"k", b"first").unwrap(), None);
    assert_eq!(strings.getset(b"k", b"second").unwrap(), Some(b"first".to_vec()));
    assert_eq!(strings.get(b"k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn test_append() {
    let map = map();
    let strings = Strings::new(&map);

    assert_eq!(strings.append(b"log", b"abc").unwrap(), 3);
    assert_eq!(strings.append(b"log", b"def").unwrap(), 6);
    assert_eq!(strings.get(b"log").unwrap(), Some(b"abcdef".to_vec()));
}

// =============================================================================
// Expiry Tests
// =============================================================================

#[test]
fn test_expired_value_reads_as_absent_and_is_removed() {
    let map = map();
    let strings = Strings::new(&map);

    strings.set_ex(b"temp", b"v", Duration::from_millis(20)).unwrap();
    assert!(strings.expire_at(b"temp").unwrap().is_some());
    assert_eq!(strings.get(b"temp").unwrap(), Some(b"v".to_vec()));

    thread::sleep(Duration::from_millis(60));

    assert_eq!(strings.get(b"temp").unwrap(), None);
    assert_eq!(strings.expire_at(b"temp").unwrap(), None);
    assert_eq!(map.count_records().unwrap(), 0);
}

#[test]
fn test_set_clears_expiry() {
    let map = map();
    let strings = Strings::new(&map);

    strings.set_ex(b"k", b"v", Duration::from_secs(60)).unwrap();
    strings.set(b"k", b"w").unwrap();

    assert_eq!(strings.expire_at(b"k").unwrap(), None);
}

#[test]
fn test_setnx_replaces_expired_value() {
    let map = map();
    let strings = Strings::new(&map);

    strings.set_ex(b"k", b"old", Duration::from_millis(10)).unwrap();
    thread::sleep(Duration::from_millis(40));

    assert!(strings.setnx(b"k", b"new").unwrap());
    assert_eq!(strings.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_append_keeps_expiry() {
    let map = map();
    let strings = Strings::new(&map);

    strings.set_ex(b"k", b"a", Duration::from_secs(60)).unwrap();
    let expire = strings.expire_at(b"k").unwrap();
    strings.append(b"k", b"b").unwrap();

    assert_eq!(strings.expire_at(b"k").unwrap(), expire);
}

// =============================================================================
// Counter Tests
// =============================================================================

#[test]
fn test_incr_decr() {
    let map = map();
    let strings = Strings::new(&map);

    assert_eq!(strings.incr_by(b"n", 5).unwrap(), 5);
    assert_eq!(strings.incr_by(b"n", 10).unwrap(), 15);
    assert_eq!(strings.decr_by(b"n", 20).unwrap(), -5);
    assert_eq!(strings.get(b"n").unwrap(), Some(b"-5".to_vec()));
}

#[test]
fn test_incr_rejects_non_integers_and_overflow() {
    let map = map();
    let strings = Strings::new(&map);
    strings.set(b"word", b"hello").unwrap();
    strings.set(b"max", i64::MAX.to_string().as_bytes()).unwrap();

    assert!(matches!(strings.incr_by(b"word", 1), Err(BasaltError::InvalidValue(_))));
    assert!(matches!(strings.incr_by(b"max", 1), Err(BasaltError::InvalidValue(_))));
    assert!(matches!(strings.decr_by(b"n", i64::MIN), Err(BasaltError::InvalidValue(_))));
    assert_eq!(strings.get(b"word").unwrap(), Some(b"hello".to_vec()));
}

#[test]
fn test_concurrent_increments() {
    let map = map();

    thread::scope(|s| {
        for _ in 0..8 {
            let map = &map;
            s.spawn(move || {
                let strings = Strings::new(map);
                for _ in 0..250 {
                    strings.incr_by(b"hits", 1).unwrap();
                }
            });
        }
    });

    assert_eq!(Strings::new(&map).get(b"hits").unwrap(), Some(b"2000".to_vec()));
}
