//! Tests for DataBlock
//!
//! These tests verify:
//! - Point put/get/delete and overwrite reporting
//! - The empty-key sentinel survives deletes and compaction
//! - A full block refuses a put without changing
//! - Split and merge conserve records and bytes
//! - External placement and compressed blocks stay readable
//! - Block scanner cursor movement

use basaltkv::block::{BlockContext, DataBlock, PutStatus, RecordOptions, ScanState};
use basaltkv::codec::CodecType;
use basaltkv::config::Config;

// =============================================================================
// Helper Functions
// =============================================================================

fn context(block_size: usize) -> BlockContext {
    let config = Config::builder()
        .max_block_size(block_size)
        .max_index_block_size(block_size)
        .build();
    BlockContext::new(config).unwrap()
}

fn lz4_context() -> BlockContext {
    let config = Config::builder()
        .max_block_size(512)
        .max_index_block_size(512)
        .codec(CodecType::Lz4)
        .build();
    BlockContext::new(config).unwrap()
}

fn opts() -> RecordOptions {
    RecordOptions::default()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:03}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{:014}", i).into_bytes()
}

/// Block holding `count` records starting at `from`
fn filled(ctx: &BlockContext, from: usize, count: usize) -> DataBlock {
    let mut block = DataBlock::new(ctx, 0).unwrap();
    for i in from..from + count {
        let status = block.put(ctx, &key(i), &value(i), &opts()).unwrap();
        assert_eq!(status, PutStatus::Inserted);
    }
    block
}

fn keys(ctx: &BlockContext, block: &DataBlock) -> Vec<Vec<u8>> {
    block.entries(ctx).unwrap().into_iter().map(|e| e.key).collect()
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[test]
fn test_put_get_and_overwrite() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();

    assert_eq!(block.put(&ctx, b"a", b"1", &opts()).unwrap(), PutStatus::Inserted);
    assert_eq!(block.put(&ctx, b"a", b"2", &opts()).unwrap(), PutStatus::Updated(None));

    let entry = block.get(&ctx, b"a").unwrap().unwrap();
    assert_eq!(entry.value, b"2".to_vec());
    assert_eq!(entry.expire, None);
    assert_eq!(block.len(), 1);
    assert!(block.get(&ctx, b"b").unwrap().is_none());
}

#[test]
fn test_expire_is_stored_with_record() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    let with_expire = RecordOptions {
        expire: Some(1_700_000_000_000),
        custom: false,
    };

    block.put(&ctx, b"k", b"v", &with_expire).unwrap();

    let entry = block.get(&ctx, b"k").unwrap().unwrap();
    assert_eq!(entry.expire, Some(1_700_000_000_000));
    assert!(!entry.custom);
}

#[test]
fn test_keys_are_kept_in_unsigned_order() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    for k in [&b"b"[..], b"\xff", b"a", b"ab", b"\x00"] {
        block.put(&ctx, k, b"v", &opts()).unwrap();
    }

    assert_eq!(
        keys(&ctx, &block),
        vec![b"\x00".to_vec(), b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), b"\xff".to_vec()]
    );
    assert_eq!(block.first_key(&ctx).unwrap(), Some(b"\x00".to_vec()));
    assert_eq!(block.last_key(&ctx).unwrap(), Some(b"\xff".to_vec()));
}

#[test]
fn test_delete_returns_removed_entry() {
    let ctx = context(512);
    let mut block = filled(&ctx, 0, 3);

    let removed = block.delete(&ctx, &key(1)).unwrap().unwrap();

    assert_eq!(removed.value, value(1));
    assert!(!block.contains(&ctx, &key(1)).unwrap());
    assert!(block.delete(&ctx, &key(1)).unwrap().is_none());
    assert_eq!(block.len(), 2);
}

#[test]
fn test_sentinel_is_never_deleted() {
    let ctx = context(512);
    let mut block = DataBlock::with_sentinel(&ctx, 0).unwrap();

    assert!(block.has_sentinel());
    assert!(block.delete(&ctx, b"").unwrap().is_none());
    assert_eq!(block.len(), 1);
    assert_eq!(block.record_count(), 0);
    assert!(block.entries(&ctx).unwrap().is_empty());
}

#[test]
fn test_full_block_refuses_put_unchanged() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();

    let mut refused = None;
    for i in 0..100 {
        if block.put(&ctx, &key(i), &value(i), &opts()).unwrap() == PutStatus::Full {
            refused = Some(i);
            break;
        }
    }

    let i = refused.expect("block should fill up");
    let len = block.len();
    let size = block.data_size();
    assert_eq!(block.put(&ctx, &key(i), &value(i), &opts()).unwrap(), PutStatus::Full);
    assert_eq!(block.len(), len);
    assert_eq!(block.data_size(), size);
    assert!(block.get(&ctx, &key(i)).unwrap().is_none());
    assert!(block.capacity() <= 512);
}

#[test]
fn test_block_grows_through_size_classes() {
    let ctx = context(4096);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    assert_eq!(block.capacity(), 128);

    for i in 0..20 {
        block.put(&ctx, &key(i), &value(i), &opts()).unwrap();
    }

    assert!(block.capacity().is_power_of_two());
    assert!(block.capacity() >= block.data_size());
    assert!(block.capacity() < 2 * block.data_size().max(128));
}

// =============================================================================
// Structural Operation Tests
// =============================================================================

#[test]
fn test_split_conserves_count_and_size() {
    let ctx = context(512);
    let mut left = filled(&ctx, 0, 12);
    let (count, size) = (left.len(), left.data_size());

    let right = left.split(&ctx, 0, false).unwrap();

    assert_eq!(left.len() + right.len(), count);
    assert_eq!(left.data_size() + right.data_size(), size);
    assert!(left.len() >= 1 && right.len() >= 1);
    assert!(left.last_key(&ctx).unwrap() < right.first_key(&ctx).unwrap());

    let mut all = keys(&ctx, &left);
    all.extend(keys(&ctx, &right));
    assert_eq!(all, (0..12).map(key).collect::<Vec<_>>());
}

#[test]
fn test_split_is_byte_balanced() {
    let ctx = context(512);
    let mut left = filled(&ctx, 0, 10);

    let right = left.split(&ctx, 0, false).unwrap();

    // equal-sized records split evenly
    assert_eq!(left.len(), 5);
    assert_eq!(right.len(), 5);
}

#[test]
fn test_split_single_record_fails() {
    let ctx = context(512);
    let mut block = filled(&ctx, 0, 1);

    assert!(block.split(&ctx, 0, false).is_err());
    assert_eq!(block.len(), 1);
}

#[test]
fn test_merge_produces_sorted_union() {
    let ctx = context(512);
    let mut left = filled(&ctx, 0, 4);
    let mut right = filled(&ctx, 4, 4);
    let size = left.data_size() + right.data_size();

    assert!(left.merge(&ctx, &mut right, true).unwrap());

    assert_eq!(keys(&ctx, &left), (0..8).map(key).collect::<Vec<_>>());
    assert_eq!(left.data_size(), size);
    assert!(right.is_empty());
}

#[test]
fn test_merge_refuses_oversized_union() {
    let ctx = context(512);
    let mut left = filled(&ctx, 0, 10);
    let mut right = filled(&ctx, 10, 10);

    assert!(!left.merge(&ctx, &mut right, true).unwrap());

    assert_eq!(left.len(), 10);
    assert_eq!(right.len(), 10);
    assert_eq!(right.get(&ctx, &key(15)).unwrap().unwrap().value, value(15));
}

#[test]
fn test_compact_after_deleting_everything_keeps_sentinel() {
    let ctx = context(512);
    let mut block = DataBlock::with_sentinel(&ctx, 0).unwrap();
    for i in 0..10 {
        block.put(&ctx, &key(i), &value(i), &opts()).unwrap();
    }
    assert!(block.capacity() > 128);

    for i in 0..10 {
        assert!(block.delete(&ctx, &key(i)).unwrap().is_some());
    }
    assert!(block.compact(&ctx, true).unwrap());

    assert_eq!(block.len(), 1);
    assert_eq!(block.first_key(&ctx).unwrap(), Some(Vec::new()));
    assert_eq!(block.capacity(), 128);
}

#[test]
fn test_compact_without_gain_reports_nothing() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    block.put(&ctx, b"a", b"1", &opts()).unwrap();

    assert!(!block.compact(&ctx, true).unwrap());
    assert!(block.compact(&ctx, false).unwrap());
    assert_eq!(block.get(&ctx, b"a").unwrap().unwrap().value, b"1".to_vec());
}

// =============================================================================
// Placement and Compression Tests
// =============================================================================

#[test]
fn test_large_value_is_stored_externally() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    let big = vec![7u8; 300];

    block.put(&ctx, b"big", &big, &opts()).unwrap();

    assert_eq!(block.get(&ctx, b"big").unwrap().unwrap().value, big);
    assert!(block.data_size() < 300);
    assert!(ctx.stats.snapshot().external_data_size >= 300);

    block.delete(&ctx, b"big").unwrap();
    assert_eq!(ctx.stats.snapshot().external_data_size, 0);
}

#[test]
fn test_large_key_is_stored_externally() {
    let ctx = context(512);
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    let long_key = vec![b'k'; 200];

    block.put(&ctx, &long_key, b"small", &opts()).unwrap();
    block.put(&ctx, b"a", b"1", &opts()).unwrap();

    assert_eq!(block.get(&ctx, &long_key).unwrap().unwrap().value, b"small".to_vec());
    assert_eq!(block.first_key(&ctx).unwrap(), Some(b"a".to_vec()));
    assert_eq!(block.last_key(&ctx).unwrap(), Some(long_key));
}

#[test]
fn test_compressed_block_serves_reads_and_writes() {
    let ctx = lz4_context();
    let mut block = DataBlock::new(&ctx, 0).unwrap();
    for i in 0..8 {
        let repetitive = vec![b'x'; 40];
        block.put(&ctx, &key(i), &repetitive, &opts()).unwrap();
    }

    assert!(block.is_compressed());
    assert!(block.compressed_size().unwrap() < block.data_size());

    assert_eq!(block.get(&ctx, &key(3)).unwrap().unwrap().value, vec![b'x'; 40]);
    block.delete(&ctx, &key(3)).unwrap();
    assert_eq!(block.record_count(), 7);
    assert!(block.decompress_if_needed(&ctx).unwrap());
    assert!(!block.is_compressed());
    assert_eq!(block.len(), 7);
}

// =============================================================================
// Scanner Tests
// =============================================================================

#[test]
fn test_block_scanner_moves_both_ways() {
    let ctx = context(512);
    let block = filled(&ctx, 0, 3);
    let mut scanner = block.scanner(&ctx).unwrap();

    assert_eq!(scanner.state(), ScanState::BeforeFirst);
    assert!(scanner.has_next());
    assert_eq!(scanner.next().unwrap().key, key(0));
    assert_eq!(scanner.next().unwrap().key, key(1));
    assert_eq!(scanner.previous().unwrap().key, key(0));
    assert_eq!(scanner.last().unwrap().key, key(2));
    assert!(!scanner.has_next());
    assert!(scanner.next().is_none());
    assert_eq!(scanner.state(), ScanState::Exhausted);
    assert_eq!(scanner.previous().unwrap().key, key(2));
}

#[test]
fn test_block_scanner_skips_sentinel() {
    let ctx = context(512);
    let mut block = DataBlock::with_sentinel(&ctx, 0).unwrap();
    block.put(&ctx, b"only", b"1", &opts()).unwrap();

    let mut scanner = block.scanner(&ctx).unwrap();

    assert_eq!(scanner.len(), 1);
    assert_eq!(scanner.next().unwrap().key, b"only".to_vec());
    assert!(scanner.next().is_none());
}
