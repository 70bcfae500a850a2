//! Tests for map snapshots
//!
//! These tests verify:
//! - Snapshot and load round-trip plain records, expiry and lists
//! - Loading without a snapshot yields an empty map
//! - Corrupted or truncated files are rejected before anything is loaded

use std::fs;

use basaltkv::codec::CodecType;
use basaltkv::{BasaltError, Config, Lists, PutOptions, ScanMode, SortedMap, Strings};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .max_block_size(512)
        .max_index_block_size(512)
        .list_max_segment_size(64)
        .build()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn dump(map: &SortedMap) -> Vec<(Vec<u8>, Vec<u8>, Option<u64>)> {
    map.scanner(b"", b"", ScanMode::Safe)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| !e.custom)
        .map(|e| (e.key, e.value, e.expire))
        .collect()
}

fn write_sample(dir: &TempDir) -> u64 {
    let map = SortedMap::new(config(dir)).unwrap();
    for i in 0..200 {
        map.put(&key(i), format!("value-{}", i).as_bytes()).unwrap();
    }
    map.snapshot().unwrap()
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_load_without_snapshot_is_empty() {
    let dir = TempDir::new().unwrap();

    let map = SortedMap::load(config(&dir)).unwrap();

    assert_eq!(map.count_records().unwrap(), 0);
    assert!(!map.snapshot_path().exists());
}

#[test]
fn test_plain_records_round_trip() {
    let dir = TempDir::new().unwrap();
    let original = SortedMap::new(config(&dir)).unwrap();
    for i in 0..500 {
        original.put(&key(i), format!("value-{}", i).as_bytes()).unwrap();
    }
    original.put(b"large", &vec![9u8; 3000]).unwrap();
    original
        .put_with_options(
            b"expiring",
            b"soon",
            PutOptions {
                expire: Some(4_102_444_800_000),
                custom: false,
            },
        )
        .unwrap();

    let written = original.snapshot().unwrap();
    assert_eq!(written, 502);
    assert!(original.snapshot_path().exists());

    let loaded = SortedMap::load(config(&dir)).unwrap();

    assert_eq!(loaded.count_records().unwrap(), 502);
    assert_eq!(dump(&loaded), dump(&original));
    assert_eq!(loaded.get(b"large").unwrap(), Some(vec![9u8; 3000]));
    assert_eq!(loaded.get_expire(b"expiring").unwrap(), Some(4_102_444_800_000));
}

#[test]
fn test_lists_round_trip() {
    let dir = TempDir::new().unwrap();
    let original = SortedMap::new(config(&dir)).unwrap();
    let lists = Lists::new(&original);
    let elements: Vec<String> = (0..150).map(|i| format!("element-{}", i)).collect();
    let refs: Vec<&[u8]> = elements.iter().map(|e| e.as_bytes()).collect();
    lists.rpush(b"big", &refs).unwrap();
    lists.lpush(b"small", &[&b"x"[..], &b"y"[..]]).unwrap();
    Strings::new(&original).set(b"name", b"basalt").unwrap();

    assert_eq!(original.snapshot().unwrap(), 3);

    let loaded = SortedMap::load(config(&dir)).unwrap();
    let loaded_lists = Lists::new(&loaded);

    assert_eq!(loaded_lists.lrange(b"big", 0, -1).unwrap(), lists.lrange(b"big", 0, -1).unwrap());
    assert_eq!(loaded_lists.check_integrity(b"big").unwrap(), 150);
    assert_eq!(loaded_lists.lrange(b"small", 0, -1).unwrap(), vec![b"y".to_vec(), b"x".to_vec()]);
    assert_eq!(Strings::new(&loaded).get(b"name").unwrap(), Some(b"basalt".to_vec()));

    // the restored chain is independent of the original
    loaded_lists.rpush(b"big", &[&b"tail"[..]]).unwrap();
    assert_eq!(lists.llen(b"big").unwrap(), 150);
    assert_eq!(loaded_lists.llen(b"big").unwrap(), 151);
}

#[test]
fn test_compressed_snapshot_round_trip() {
    let dir = TempDir::new().unwrap();
    let compressed = Config::builder()
        .data_dir(dir.path())
        .codec(CodecType::Lz4)
        .build();
    let original = SortedMap::new(compressed.clone()).unwrap();
    let lists = Lists::new(&original);
    for i in 0..100 {
        let element = format!("repeated repeated repeated {}", i);
        lists.rpush(b"l", &[element.as_bytes()]).unwrap();
    }
    original.snapshot().unwrap();

    let loaded = SortedMap::load(compressed).unwrap();

    assert_eq!(
        Lists::new(&loaded).lrange(b"l", 0, -1).unwrap(),
        lists.lrange(b"l", 0, -1).unwrap()
    );
}

#[test]
fn test_snapshot_overwrites_previous() {
    let dir = TempDir::new().unwrap();
    let map = SortedMap::new(config(&dir)).unwrap();
    map.put(b"a", b"1").unwrap();
    map.snapshot().unwrap();
    map.delete(b"a").unwrap();
    map.put(b"b", b"2").unwrap();
    map.snapshot().unwrap();

    let loaded = SortedMap::load(config(&dir)).unwrap();

    assert_eq!(loaded.get(b"a").unwrap(), None);
    assert_eq!(loaded.get(b"b").unwrap(), Some(b"2".to_vec()));
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_byte_is_detected() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir);
    let path = dir.path().join(basaltkv::map::SNAPSHOT_FILE);
    let mut data = fs::read(&path).unwrap();
    let middle = data.len() / 2;
    data[middle] ^= 0x5A;
    fs::write(&path, &data).unwrap();

    let result = SortedMap::load(config(&dir));

    assert!(matches!(result, Err(BasaltError::SnapshotCorruption(_))));
}

#[test]
fn test_truncated_file_is_detected() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir);
    let path = dir.path().join(basaltkv::map::SNAPSHOT_FILE);
    let data = fs::read(&path).unwrap();
    fs::write(&path, &data[..data.len() - 20]).unwrap();

    assert!(matches!(
        SortedMap::load(config(&dir)),
        Err(BasaltError::SnapshotCorruption(_))
    ));
}

#[test]
fn test_bad_magic_is_detected() {
    let dir = TempDir::new().unwrap();
    write_sample(&dir);
    let path = dir.path().join(basaltkv::map::SNAPSHOT_FILE);
    let mut data = fs::read(&path).unwrap();
    data[0] = b'X';
    fs::write(&path, &data).unwrap();

    assert!(matches!(
        SortedMap::load(config(&dir)),
        Err(BasaltError::SnapshotCorruption(_))
    ));
}

#[test]
fn test_snapshot_after_dispose_fails() {
    let dir = TempDir::new().unwrap();
    let map = SortedMap::new(config(&dir)).unwrap();
    map.dispose().unwrap();

    assert!(matches!(map.snapshot(), Err(BasaltError::Disposed)));
}
