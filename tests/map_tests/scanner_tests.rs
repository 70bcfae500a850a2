//! Tests for map scanners
//!
//! These tests verify:
//! - Forward and reverse iteration over bounded and unbounded ranges
//! - Cursor movement with previous/last and has_next
//! - Live scanners see later changes, safe scanners a fixed point in time
//! - Scans stay ordered while other threads delete

use std::thread;

use basaltkv::block::ScanState;
use basaltkv::{Config, ScanMode, SortedMap};

// =============================================================================
// Helper Functions
// =============================================================================

fn map_with(count: usize) -> SortedMap {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(512)
        .build();
    let map = SortedMap::new(config).unwrap();
    for i in 0..count {
        map.put(&key(i), &value(i)).unwrap();
    }
    map
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("v{}", i).into_bytes()
}

fn collect(map: &SortedMap, start: &[u8], stop: &[u8], mode: ScanMode, reverse: bool) -> Vec<Vec<u8>> {
    let scanner = if reverse {
        map.reverse_scanner(start, stop, mode).unwrap()
    } else {
        map.scanner(start, stop, mode).unwrap()
    };
    scanner.map(|e| e.unwrap().key).collect()
}

// =============================================================================
// Range Tests
// =============================================================================

#[test]
fn test_full_forward_scan() {
    let map = map_with(500);

    for mode in [ScanMode::Live, ScanMode::Safe] {
        assert_eq!(
            collect(&map, b"", b"", mode, false),
            (0..500).map(key).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_full_reverse_scan() {
    let map = map_with(500);

    for mode in [ScanMode::Live, ScanMode::Safe] {
        assert_eq!(
            collect(&map, b"", b"", mode, true),
            (0..500).rev().map(key).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_bounded_range_is_half_open() {
    let map = map_with(500);

    for mode in [ScanMode::Live, ScanMode::Safe] {
        assert_eq!(
            collect(&map, &key(100), &key(250), mode, false),
            (100..250).map(key).collect::<Vec<_>>()
        );
        assert_eq!(
            collect(&map, &key(100), &key(250), mode, true),
            (100..250).rev().map(key).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_bounds_between_keys() {
    let map = map_with(100);

    // "key00010x" sorts between key(10) and key(11)
    let keys = collect(&map, b"key00010x", b"key00020x", ScanMode::Live, false);

    assert_eq!(keys, (11..=20).map(key).collect::<Vec<_>>());
}

#[test]
fn test_one_sided_bounds() {
    let map = map_with(100);

    assert_eq!(
        collect(&map, &key(90), b"", ScanMode::Live, false),
        (90..100).map(key).collect::<Vec<_>>()
    );
    assert_eq!(
        collect(&map, b"", &key(10), ScanMode::Safe, true),
        (0..10).rev().map(key).collect::<Vec<_>>()
    );
}

#[test]
fn test_empty_map_and_empty_range() {
    let map = map_with(0);
    assert!(collect(&map, b"", b"", ScanMode::Live, false).is_empty());
    assert!(collect(&map, b"", b"", ScanMode::Safe, true).is_empty());

    let map = map_with(50);
    assert!(collect(&map, b"zzz", b"", ScanMode::Live, false).is_empty());
    assert!(collect(&map, &key(20), &key(20), ScanMode::Safe, false).is_empty());
}

#[test]
fn test_scan_yields_values_and_expire() {
    let map = map_with(0);
    map.put_with_options(
        b"a",
        b"1",
        basaltkv::PutOptions {
            expire: Some(42),
            custom: false,
        },
    )
    .unwrap();

    let entry = map.scanner(b"", b"", ScanMode::Live).unwrap().next().unwrap().unwrap();

    assert_eq!(entry.value, b"1".to_vec());
    assert_eq!(entry.expire, Some(42));
}

// =============================================================================
// Cursor Movement Tests
// =============================================================================

#[test]
fn test_next_previous_last() {
    let map = map_with(200);

    for mode in [ScanMode::Live, ScanMode::Safe] {
        let mut scanner = map.scanner(&key(10), &key(150), mode).unwrap();
        assert_eq!(scanner.state(), ScanState::BeforeFirst);

        assert_eq!(scanner.next_record().unwrap().unwrap().key, key(10));
        assert_eq!(scanner.next_record().unwrap().unwrap().key, key(11));
        assert_eq!(scanner.previous_record().unwrap().unwrap().key, key(10));
        assert!(scanner.previous_record().unwrap().is_none());
        assert_eq!(scanner.state(), ScanState::BeforeFirst);
        assert_eq!(scanner.next_record().unwrap().unwrap().key, key(10));

        assert_eq!(scanner.last_record().unwrap().unwrap().key, key(149));
        assert_eq!(scanner.state(), ScanState::Positioned);
        assert!(!scanner.has_next().unwrap());
        assert!(scanner.next_record().unwrap().is_none());
        assert_eq!(scanner.state(), ScanState::Exhausted);
        assert_eq!(scanner.previous_record().unwrap().unwrap().key, key(149));
    }
}

#[test]
fn test_reverse_cursor_movement() {
    let map = map_with(100);
    let mut scanner = map.reverse_scanner(&key(20), &key(30), ScanMode::Live).unwrap();

    assert!(scanner.is_reverse());
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(29));
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(28));
    assert_eq!(scanner.previous_record().unwrap().unwrap().key, key(29));
    assert_eq!(scanner.last_record().unwrap().unwrap().key, key(20));
    assert!(scanner.next_record().unwrap().is_none());
}

#[test]
fn test_has_next_does_not_consume() {
    let map = map_with(3);
    let mut scanner = map.scanner(b"", b"", ScanMode::Live).unwrap();

    assert!(scanner.has_next().unwrap());
    assert!(scanner.has_next().unwrap());
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(0));
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(1));
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(2));
    assert!(!scanner.has_next().unwrap());
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_live_scan_sees_later_inserts() {
    let map = map_with(100);
    let mut scanner = map.scanner(b"", b"", ScanMode::Live).unwrap();
    assert_eq!(scanner.next_record().unwrap().unwrap().key, key(0));

    map.put(&key(500), b"late").unwrap();

    let rest: Vec<Vec<u8>> = scanner.map(|e| e.unwrap().key).collect();
    assert_eq!(rest.len(), 100);
    assert_eq!(rest.last().unwrap(), &key(500));
}

#[test]
fn test_safe_scan_ignores_later_changes() {
    let map = map_with(100);
    let scanner = map.scanner(b"", b"", ScanMode::Safe).unwrap();

    map.put(&key(500), b"late").unwrap();
    map.delete(&key(0)).unwrap();

    let keys: Vec<Vec<u8>> = scanner.map(|e| e.unwrap().key).collect();
    assert_eq!(keys, (0..100).map(key).collect::<Vec<_>>());
}

#[test]
fn test_safe_scan_while_deleting() {
    let map = map_with(1000);
    let scanner = map.scanner(b"", b"", ScanMode::Safe).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for i in (0..1000).step_by(5) {
                assert!(map.delete(&key(i)).unwrap());
            }
        });
    });

    let seen: Vec<Vec<u8>> = scanner.map(|e| e.unwrap().key).collect();
    assert_eq!(seen, (0..1000).map(key).collect::<Vec<_>>());
    assert_eq!(map.count_records().unwrap(), 800);
}

#[test]
fn test_live_scan_during_concurrent_deletes() {
    let map = map_with(2000);

    let seen = thread::scope(|s| {
        let deleter = s.spawn(|| {
            for i in (0..2000).step_by(5) {
                map.delete(&key(i)).unwrap();
            }
        });
        let seen: Vec<Vec<u8>> = map
            .scanner(b"", b"", ScanMode::Live)
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect();
        deleter.join().unwrap();
        seen
    });

    // strictly ascending, and nothing that was never deleted goes missing
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    for i in (0..2000).filter(|i| i % 5 != 0) {
        assert!(seen.binary_search(&key(i)).is_ok());
    }
    assert_eq!(collect(&map, b"", b"", ScanMode::Safe, false).len(), 1600);
}
