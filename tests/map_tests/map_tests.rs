//! Tests for SortedMap
//!
//! These tests verify:
//! - Point operations and key validation
//! - Ordered contents after many inserts and structural changes
//! - Concurrent writers on disjoint and overlapping keys
//! - Read-modify-write operations
//! - Memory ceiling and disposal behaviour

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use basaltkv::block::Entry;
use basaltkv::codec::CodecType;
use basaltkv::map::{Mutation, Operation};
use basaltkv::{BasaltError, Config, PutOptions, ScanMode, SortedMap};

// =============================================================================
// Helper Functions
// =============================================================================

fn small_map() -> SortedMap {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(512)
        .build();
    SortedMap::new(config).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

fn all_keys(map: &SortedMap) -> Vec<Vec<u8>> {
    map.scanner(b"", b"", ScanMode::Safe)
        .unwrap()
        .map(|e| e.unwrap().key)
        .collect()
}

/// Counts calls and stores the call number
struct CountingPut {
    key: Vec<u8>,
    calls: usize,
    mutation: Mutation,
}

impl Operation for CountingPut {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        self.calls += 1;
        self.mutation = Mutation::Put {
            value: self.calls.to_string().into_bytes(),
            expire: None,
            custom: false,
        };
        found.is_none()
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }

    fn reset(&mut self) {
        self.mutation = Mutation::None;
    }
}

/// Reads without mutating
struct Peek {
    key: Vec<u8>,
    seen: Option<Vec<u8>>,
}

impl Operation for Peek {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        self.seen = found.map(|e| e.value.clone());
        self.seen.is_some()
    }
}

/// Deletes the record when its value matches
struct DeleteIfEquals {
    key: Vec<u8>,
    expected: Vec<u8>,
    mutation: Mutation,
}

impl Operation for DeleteIfEquals {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&Entry>) -> bool {
        if found.is_some_and(|e| e.value == self.expected) {
            self.mutation = Mutation::Delete;
            return true;
        }
        false
    }

    fn take_mutation(&mut self) -> Mutation {
        std::mem::take(&mut self.mutation)
    }
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_delete() {
    let map = small_map();

    assert!(map.put(b"alpha", b"1").unwrap());
    assert!(map.put(b"beta", b"2").unwrap());
    assert!(map.put(b"alpha", b"3").unwrap());

    assert_eq!(map.get(b"alpha").unwrap(), Some(b"3".to_vec()));
    assert!(map.exists(b"beta").unwrap());
    assert!(!map.exists(b"gamma").unwrap());
    assert_eq!(map.count_records().unwrap(), 2);

    assert!(map.delete(b"alpha").unwrap());
    assert!(!map.delete(b"alpha").unwrap());
    assert_eq!(map.get(b"alpha").unwrap(), None);
    assert_eq!(map.count_records().unwrap(), 1);
}

#[test]
fn test_empty_key_is_reserved() {
    let map = small_map();

    assert!(matches!(map.put(b"", b"v"), Err(BasaltError::InvalidKey(_))));
    assert_eq!(map.get(b"").unwrap(), None);
    assert!(!map.exists(b"").unwrap());
    assert!(!map.delete(b"").unwrap());
    assert_eq!(map.count_records().unwrap(), 0);
}

#[test]
fn test_put_with_expire() {
    let map = small_map();
    let options = PutOptions {
        expire: Some(1_900_000_000_000),
        custom: false,
    };

    map.put_with_options(b"session", b"token", options).unwrap();

    assert_eq!(map.get_expire(b"session").unwrap(), Some(1_900_000_000_000));
    let entry = map.get_entry(b"session").unwrap().unwrap();
    assert_eq!(entry.value, b"token".to_vec());

    map.put(b"session", b"fresh").unwrap();
    assert_eq!(map.get_expire(b"session").unwrap(), None);
}

#[test]
fn test_large_records_round_trip() {
    let map = small_map();
    let long_key = vec![b'k'; 300];
    let long_value = vec![b'v'; 2000];

    map.put(&long_key, &long_value).unwrap();
    map.put(b"short", &long_value).unwrap();

    assert_eq!(map.get(&long_key).unwrap(), Some(long_value.clone()));
    assert_eq!(map.get(b"short").unwrap(), Some(long_value));
    assert!(map.memory_stats().external_data_size >= 300 + 2 * 2000);
}

// =============================================================================
// Ordering and Structure Tests
// =============================================================================

#[test]
fn test_thousand_keys_scan_in_order() {
    let map = SortedMap::new(Config::default()).unwrap();
    for i in 1..=1000 {
        let k = format!("KEY{}", i);
        assert!(map.put(k.as_bytes(), b"value").unwrap());
    }

    assert_eq!(map.count_records().unwrap(), 1000);
    let keys = all_keys(&map);
    assert_eq!(keys.len(), 1000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let mut expected: Vec<Vec<u8>> = (1..=1000).map(|i| format!("KEY{}", i).into_bytes()).collect();
    expected.sort();
    assert_eq!(keys, expected);
}

#[test]
fn test_index_blocks_split_and_retire() {
    let map = small_map();
    for i in 0..2000 {
        assert!(map.put(&key(i), &value(i)).unwrap());
    }

    assert!(map.number_of_index_blocks() > 1);
    assert!(map.number_of_data_blocks() > map.number_of_index_blocks());
    assert_eq!(all_keys(&map), (0..2000).map(key).collect::<Vec<_>>());

    for i in 0..2000 {
        assert!(map.delete(&key(i)).unwrap());
    }

    assert_eq!(map.count_records().unwrap(), 0);
    assert_eq!(map.number_of_index_blocks(), 1);
    assert!(all_keys(&map).is_empty());
    assert_eq!(map.memory_stats().data_size, 9);
}

#[test]
fn test_random_order_inserts() {
    let map = small_map();
    // 7919 is prime, so this visits every residue once
    let order: Vec<usize> = (0..1500).map(|i| (i * 7919) % 1500).collect();
    for &i in &order {
        map.put(&key(i), &value(i)).unwrap();
    }
    for &i in order.iter().step_by(3) {
        map.delete(&key(i)).unwrap();
    }

    let expected: Vec<Vec<u8>> = (0..1500)
        .filter(|i| !order.iter().step_by(3).any(|d| d == i))
        .map(key)
        .collect();
    assert_eq!(all_keys(&map), expected);
    assert_eq!(map.count_records().unwrap(), expected.len());
}

#[test]
fn test_compressed_map() {
    let config = Config::builder()
        .max_block_size(1024)
        .max_index_block_size(1024)
        .codec(CodecType::Zstd)
        .build();
    let map = SortedMap::new(config).unwrap();
    for i in 0..500 {
        map.put(&key(i), b"a fairly repetitive value a fairly repetitive value").unwrap();
    }

    let stats = map.memory_stats();
    assert!(stats.compressed_data_size > 0);
    assert!(stats.compressed_data_size < stats.data_size);
    assert_eq!(map.get(&key(250)).unwrap().unwrap().len(), 51);
    assert_eq!(all_keys(&map).len(), 500);
}

#[test]
fn test_compact_reclaims_memory() {
    let map = small_map();
    for i in 0..300 {
        map.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..300 {
        if i % 4 != 0 {
            map.delete(&key(i)).unwrap();
        }
    }
    let before = map.memory_stats().allocated_memory;

    map.compact().unwrap();

    assert!(map.memory_stats().allocated_memory <= before);
    assert_eq!(map.count_records().unwrap(), 75);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_disjoint_inserts() {
    let map = small_map();
    let threads = 8;
    let per_thread = 500;

    thread::scope(|s| {
        for t in 0..threads {
            let map = &map;
            s.spawn(move || {
                for i in 0..per_thread {
                    let n = t * per_thread + i;
                    assert!(map.put(&key(n), &value(n)).unwrap());
                }
            });
        }
    });

    assert_eq!(map.count_records().unwrap(), threads * per_thread);
    assert_eq!(
        all_keys(&map),
        (0..threads * per_thread).map(key).collect::<Vec<_>>()
    );
    for n in (0..threads * per_thread).step_by(97) {
        assert_eq!(map.get(&key(n)).unwrap(), Some(value(n)));
    }
}

#[test]
fn test_concurrent_writers_and_deleters() {
    let map = small_map();
    for i in 0..1000 {
        map.put(&key(i), &value(i)).unwrap();
    }
    let deleted = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..4 {
            let (map, deleted) = (&map, &deleted);
            s.spawn(move || {
                for i in (t..1000).step_by(4) {
                    if i % 2 == 0 && map.delete(&key(i)).unwrap() {
                        deleted.fetch_add(1, Ordering::Relaxed);
                    }
                    map.put(&key(1000 + i), &value(i)).unwrap();
                }
            });
        }
    });

    assert_eq!(deleted.load(Ordering::Relaxed), 500);
    assert_eq!(map.count_records().unwrap(), 1500);
    let keys = all_keys(&map);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_concurrent_execute_is_atomic() {
    struct AddOne(Vec<u8>, Mutation);

    impl Operation for AddOne {
        fn key(&self) -> &[u8] {
            &self.0
        }

        fn execute(&mut self, found: Option<&Entry>) -> bool {
            let n: u64 = found
                .map(|e| String::from_utf8_lossy(&e.value).parse().unwrap())
                .unwrap_or(0);
            self.1 = Mutation::Put {
                value: (n + 1).to_string().into_bytes(),
                expire: None,
                custom: false,
            };
            true
        }

        fn take_mutation(&mut self) -> Mutation {
            std::mem::take(&mut self.1)
        }

        fn reset(&mut self) {
            self.1 = Mutation::None;
        }
    }

    let map = small_map();
    thread::scope(|s| {
        for _ in 0..4 {
            let map = &map;
            s.spawn(move || {
                for _ in 0..250 {
                    map.execute(&mut AddOne(b"counter".to_vec(), Mutation::None)).unwrap();
                }
            });
        }
    });

    assert_eq!(map.get(b"counter").unwrap(), Some(b"1000".to_vec()));
}

// =============================================================================
// Execute Tests
// =============================================================================

#[test]
fn test_execute_put_and_result() {
    let map = small_map();
    let mut op = CountingPut {
        key: b"k".to_vec(),
        calls: 0,
        mutation: Mutation::None,
    };

    assert!(map.execute(&mut op).unwrap());
    assert!(!map.execute(&mut op).unwrap());
    assert_eq!(map.get(b"k").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_execute_read_only() {
    let map = small_map();
    map.put(b"k", b"v").unwrap();
    let mut op = Peek {
        key: b"k".to_vec(),
        seen: None,
    };

    assert!(map.execute(&mut op).unwrap());
    assert_eq!(op.seen, Some(b"v".to_vec()));
}

#[test]
fn test_execute_conditional_delete() {
    let map = small_map();
    map.put(b"k", b"v1").unwrap();

    let mut wrong = DeleteIfEquals {
        key: b"k".to_vec(),
        expected: b"v2".to_vec(),
        mutation: Mutation::None,
    };
    assert!(!map.execute(&mut wrong).unwrap());
    assert!(map.exists(b"k").unwrap());

    let mut right = DeleteIfEquals {
        key: b"k".to_vec(),
        expected: b"v1".to_vec(),
        mutation: Mutation::None,
    };
    assert!(map.execute(&mut right).unwrap());
    assert!(!map.exists(b"k").unwrap());
}

// =============================================================================
// Memory and Lifecycle Tests
// =============================================================================

#[test]
fn test_memory_ceiling_refuses_puts() {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(512)
        .max_memory(8 * 1024)
        .build();
    let map = SortedMap::new(config).unwrap();

    let mut stored = 0;
    for i in 0..10_000 {
        if !map.put(&key(i), &value(i)).unwrap() {
            break;
        }
        stored += 1;
    }

    assert!(stored > 0 && stored < 10_000);
    let stats = map.memory_stats();
    assert!(stats.allocated_memory <= 8 * 1024);
    assert_eq!(stats.max_memory, 8 * 1024);
    assert_eq!(map.count_records().unwrap(), stored);
    for i in 0..stored {
        assert_eq!(map.get(&key(i)).unwrap(), Some(value(i)));
    }

    // space frees up again after deletes
    for i in 0..stored / 2 {
        map.delete(&key(i)).unwrap();
    }
    assert!(map.put(b"late", b"arrival").unwrap());
}

#[test]
fn test_rewrites_and_deletes_succeed_at_ceiling() {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(512)
        .codec(CodecType::Lz4)
        .max_memory(8 * 1024)
        .build();
    let map = SortedMap::new(config).unwrap();

    let mut stored = 0;
    while stored < 10_000 && map.put(&key(stored), &value(stored)).unwrap() {
        stored += 1;
    }
    assert!(stored > 0 && stored < 10_000);

    // a value of the same length needs no new memory, compressed or not
    for i in 0..stored {
        let same_length = vec![b'z'; value(i).len()];
        assert!(map.put(&key(i), &same_length).unwrap());
        assert_eq!(map.get(&key(i)).unwrap(), Some(same_length));
    }

    for i in 0..stored {
        assert!(map.delete(&key(i)).unwrap());
    }
    assert_eq!(map.count_records().unwrap(), 0);
}

#[test]
fn test_dispose_frees_everything() {
    let map = small_map();
    for i in 0..500 {
        map.put(&key(i), &value(i)).unwrap();
    }
    map.put(b"external", &[1u8; 1000]).unwrap();
    assert!(map.memory_stats().allocated_memory > 0);

    map.dispose().unwrap();

    assert!(map.is_disposed());
    assert_eq!(map.memory_stats().allocated_memory, 0);
    assert_eq!(map.memory_stats().external_data_size, 0);
    assert!(matches!(map.put(b"k", b"v"), Err(BasaltError::Disposed)));
    assert!(matches!(map.get(b"k"), Err(BasaltError::Disposed)));
    assert!(matches!(map.scanner(b"", b"", ScanMode::Live), Err(BasaltError::Disposed)));
    // disposing twice is harmless
    map.dispose().unwrap();
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = Config::builder().max_block_size(100).build();

    assert!(matches!(SortedMap::new(config), Err(BasaltError::Config(_))));
}
