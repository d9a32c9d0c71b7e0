//! Tests for the volume index
//!
//! These tests verify:
//! - Names map to the chapter they were last recorded in
//! - Entries expire once their chapter leaves the window, without
//!   disturbing live entries of the same list
//! - A growing list rebalances its zone without losing entries
//! - Collision entries are kept and promoted correctly
//! - Zone routing and chapter windows are enforced
//! - Every zone owns a share of the delta lists
//! - Sparse indexes keep sampled names for the whole volume
//! - Hook lookups have no side effects
//! - A zone over budget drops entries and expires chapters early
//! - Counters stay exact when a full zone moves or removes entries

use dedupe_index::geometry::Geometry;
use dedupe_index::volume_index::{PutOutcome, VolumeIndex, VolumeIndexConfig};
use dedupe_index::{IndexError, RecordName};

// =============================================================================
// Helper Functions
// =============================================================================

fn dense_config(zones: u32, chapters: u32) -> VolumeIndexConfig {
    VolumeIndexConfig {
        geometry: Geometry::new(4096, 1, chapters, 0).unwrap(),
        zone_count: zones,
        sparse_sample_rate: 32,
        mean_delta: 4096,
        min_delta_lists: 16,
        nonce: 7,
    }
}

fn sparse_config(zones: u32) -> VolumeIndexConfig {
    VolumeIndexConfig {
        geometry: Geometry::new(4096, 1, 16, 8).unwrap(),
        zone_count: zones,
        sparse_sample_rate: 4,
        mean_delta: 4096,
        min_delta_lists: 16,
        nonce: 7,
    }
}

fn name(i: u64) -> RecordName {
    RecordName::from_data(&i.to_le_bytes())
}

/// A name with chosen volume index bytes, made unique by `tag`
fn name_with_index_bytes(index_bytes: u64, tag: u64) -> RecordName {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&index_bytes.to_be_bytes());
    bytes[8..].copy_from_slice(&tag.to_be_bytes());
    RecordName(bytes)
}

fn put(index: &VolumeIndex, name: &RecordName, chapter: u64) -> PutOutcome {
    index
        .put_record(index.zone_for_name(name), name, chapter)
        .unwrap()
}

/// Chapter recorded for `name`, if any
fn chapter_of(index: &VolumeIndex, name: &RecordName) -> Option<u64> {
    let record = index.get_record(index.zone_for_name(name), name).unwrap();
    record.is_found.then_some(record.virtual_chapter)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_put_and_get_record() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    index.set_open_chapter(3).unwrap();

    for i in 0..200 {
        assert_eq!(put(&index, &name(i), i % 4), PutOutcome::Inserted);
    }
    for i in 0..200 {
        assert_eq!(chapter_of(&index, &name(i)), Some(i % 4));
    }
    assert_eq!(chapter_of(&index, &name(10_000)), None);

    let stats = index.stats().combined();
    assert_eq!(stats.record_count, 200);
    assert_eq!(stats.collision_count, 0);
    assert!(index.memory_used() <= index.memory_allocated());
}

#[test]
fn test_set_record_chapter_moves_entry() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    index.set_open_chapter(5).unwrap();
    let n = name(1);
    put(&index, &n, 1);

    index.set_record_chapter(0, &n, 5).unwrap();
    assert_eq!(chapter_of(&index, &n), Some(5));
    assert_eq!(index.stats().combined().record_count, 1);

    let missing = name(2);
    assert!(index.set_record_chapter(0, &missing, 5).is_err());
}

#[test]
fn test_remove_record() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    let n = name(1);
    put(&index, &n, 0);

    assert!(index.remove_record(0, &n).unwrap());
    assert_eq!(chapter_of(&index, &n), None);
    assert!(!index.remove_record(0, &n).unwrap());
    assert_eq!(index.stats().combined().record_count, 0);
}

// =============================================================================
// Expiry Tests
// =============================================================================

#[test]
fn test_expired_chapter_is_discarded() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    let first = name(1);
    assert_eq!(put(&index, &first, 0), PutOutcome::Inserted);

    index.set_open_chapter(15).unwrap();
    for i in 2..=1000 {
        let outcome = put(&index, &name(i), 1 + i % 15);
        assert_ne!(outcome, PutOutcome::Overflow);
    }
    assert_eq!(chapter_of(&index, &first), Some(0));

    let before = index.stats().combined().discard_count;
    index.set_open_chapter(16).unwrap();
    assert_eq!(chapter_of(&index, &first), None);
    assert_eq!(index.stats().combined().discard_count, before + 1);

    // Names from later chapters survive
    assert_eq!(chapter_of(&index, &name(2)), Some(1 + 2 % 15));
    assert_eq!(chapter_of(&index, &name(1000)), Some(1 + 1000 % 15));
}

#[test]
fn test_discard_keeps_live_neighbors_in_the_list() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    index.set_open_chapter(15).unwrap();

    // Only the low address bits differ, so every name lands in one list
    let base = 0xabcd_ef01_2000_0000u64;
    let expired: Vec<_> = (0..2u64).map(|i| name_with_index_bytes(base + i * 5, i)).collect();
    let live: Vec<_> = (0..20u64)
        .map(|i| name_with_index_bytes(base + 100 + i * 17, 100 + i))
        .collect();
    for n in &expired {
        assert_eq!(put(&index, n, 0), PutOutcome::Inserted);
    }
    for (i, n) in live.iter().enumerate() {
        assert_eq!(put(&index, n, 1 + i as u64 % 15), PutOutcome::Inserted);
    }

    let before = index.stats().combined();
    index.set_open_chapter(16).unwrap();
    for (i, n) in live.iter().enumerate() {
        assert_eq!(chapter_of(&index, n), Some(1 + i as u64 % 15), "live name {}", i);
    }
    for n in &expired {
        assert_eq!(chapter_of(&index, n), None);
    }

    let after = index.stats().combined();
    assert_eq!(after.discard_count, before.discard_count + 2);
    assert_eq!(after.record_count, live.len() as u64);
}

#[test]
fn test_chapter_numbers_survive_wraparound() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    let mut names = Vec::new();
    for chapter in 0..200u64 {
        index.set_open_chapter(chapter).unwrap();
        let n = name(chapter);
        put(&index, &n, chapter);
        names.push(n);
    }

    for (chapter, n) in names.iter().enumerate() {
        let expected = (chapter as u64 >= 184).then_some(chapter as u64);
        assert_eq!(chapter_of(&index, n), expected, "chapter {}", chapter);
    }
}

// =============================================================================
// Rebalance Tests
// =============================================================================

#[test]
fn test_growing_list_rebalances_once() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();

    // Volume index bytes below 2^20 all land in list 0
    let mut inserted = Vec::new();
    let mut rebalanced = false;
    for i in 0..1000u64 {
        let before = index.stats().combined().rebalance_count;
        let n = name_with_index_bytes(i * 997, i);
        assert_eq!(put(&index, &n, 0), PutOutcome::Inserted);
        inserted.push(n);

        let after = index.stats().combined().rebalance_count;
        if after != before {
            assert_eq!(after, before + 1);
            rebalanced = true;
            break;
        }
    }

    assert!(rebalanced, "list 0 never outgrew its space");
    for n in &inserted {
        assert_eq!(chapter_of(&index, n), Some(0));
    }
}

// =============================================================================
// Collision Tests
// =============================================================================

#[test]
fn test_collision_entries() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    index.set_open_chapter(2).unwrap();
    let primary = name_with_index_bytes(0x1234_5678, 1);
    let second = name_with_index_bytes(0x1234_5678, 2);
    let unseen = name_with_index_bytes(0x1234_5678, 3);

    assert_eq!(put(&index, &primary, 1), PutOutcome::Inserted);
    assert_eq!(put(&index, &second, 2), PutOutcome::Collision);
    assert_eq!(put(&index, &second, 2), PutOutcome::Updated);

    let record = index.get_record(0, &second).unwrap();
    assert!(record.is_found && record.is_collision);
    assert_eq!(record.virtual_chapter, 2);

    let record = index.get_record(0, &primary).unwrap();
    assert!(record.is_found && !record.is_collision);
    assert_eq!(record.virtual_chapter, 1);

    // A name sharing the address matches the primary entry
    let record = index.get_record(0, &unseen).unwrap();
    assert!(record.is_found && !record.is_collision);

    let stats = index.stats().combined();
    assert_eq!(stats.record_count, 2);
    assert_eq!(stats.collision_count, 1);
}

#[test]
fn test_removing_primary_promotes_collision() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    index.set_open_chapter(2).unwrap();
    let primary = name_with_index_bytes(0x42_0000, 1);
    let second = name_with_index_bytes(0x42_0000, 2);
    put(&index, &primary, 1);
    put(&index, &second, 2);

    assert!(index.remove_record(0, &primary).unwrap());

    let record = index.get_record(0, &second).unwrap();
    assert!(record.is_found && !record.is_collision);
    assert_eq!(record.virtual_chapter, 2);
    let stats = index.stats().combined();
    assert_eq!(stats.record_count, 1);
    assert_eq!(stats.collision_count, 0);
}

// =============================================================================
// Contract Violation Tests
// =============================================================================

#[test]
fn test_wrong_zone_is_rejected() {
    let index = VolumeIndex::new(&dense_config(2, 16)).unwrap();
    let n = (0..)
        .map(name)
        .find(|n| index.zone_for_name(n) == 1)
        .unwrap();

    let err = index.get_record(0, &n).unwrap_err();
    assert!(matches!(err, IndexError::InvalidArgument(_)));
    assert!(index.put_record(0, &n, 0).is_err());
    assert!(index.get_record(1, &n).is_ok());
    assert!(index.get_record(2, &n).is_err());
}

#[test]
fn test_chapter_outside_window_is_rejected() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();
    let n = name(1);
    assert!(index.put_record(0, &n, 1).is_err());

    index.set_open_chapter(20).unwrap();
    assert!(index.put_record(0, &n, 4).is_err());
    assert!(index.put_record(0, &n, 5).is_ok());
    assert!(index.set_open_chapter(19).is_err());
    assert_eq!(index.open_chapter(), 20);
}

#[test]
fn test_every_zone_owns_lists() {
    for zones in [3u32, 5, 7] {
        let index = VolumeIndex::new(&dense_config(zones, 16)).unwrap();
        index.set_open_chapter(15).unwrap();

        let mut per_zone = vec![0u64; zones as usize];
        for i in 0..5000 {
            per_zone[index.zone_for_name(&name(i)) as usize] += 1;
        }
        let min = *per_zone.iter().min().unwrap();
        let max = *per_zone.iter().max().unwrap();
        assert!(min > 0, "{} zones: {:?}", zones, per_zone);
        assert!(max < 2 * min, "{} zones: {:?}", zones, per_zone);

        // Each zone's arena takes its own names
        for i in 0..1000 {
            assert_ne!(put(&index, &name(i), i % 16), PutOutcome::Overflow);
        }
        assert_eq!(index.stats().combined().record_count, 1000);
    }
}

#[test]
fn test_invalid_configs_are_rejected() {
    let mut config = dense_config(0, 16);
    assert!(VolumeIndex::new(&config).is_err());
    config.zone_count = 17;
    assert!(VolumeIndex::new(&config).is_err());

    let mut config = sparse_config(1);
    config.sparse_sample_rate = 1;
    assert!(VolumeIndex::new(&config).is_err());
}

// =============================================================================
// Sparse Index Tests
// =============================================================================

#[test]
fn test_sparse_index_keeps_sampled_names() {
    let index = VolumeIndex::new(&sparse_config(1)).unwrap();
    let sampled = (0..).map(name).find(|n| index.is_sample(n)).unwrap();
    let dense = (0..).map(name).find(|n| !index.is_sample(n)).unwrap();

    put(&index, &sampled, 0);
    put(&index, &dense, 0);
    assert_eq!(index.lookup_name(&sampled).unwrap(), Some(0));
    assert_eq!(index.lookup_name(&dense).unwrap(), None);

    // Past the dense window, inside the full window
    index.set_open_chapter(10).unwrap();
    assert_eq!(chapter_of(&index, &dense), None);
    assert_eq!(chapter_of(&index, &sampled), Some(0));

    // Past the full window
    index.set_open_chapter(16).unwrap();
    assert_eq!(index.lookup_name(&sampled).unwrap(), None);
    assert_eq!(chapter_of(&index, &sampled), None);

    let stats = index.stats();
    assert_eq!(stats.dense.discard_count, 1);
    assert_eq!(stats.sparse.discard_count, 1);
}

#[test]
fn test_lookup_name_has_no_side_effects() {
    let index = VolumeIndex::new(&sparse_config(2)).unwrap();
    // Sampling bytes are the last two bytes of the tag
    let hook = name_with_index_bytes(0x1234_5678_9abc_def0, 4);
    let other = name_with_index_bytes(0x0fed_cba9_8765_4321, 5);
    assert!(index.is_sample(&hook));
    assert!(!index.is_sample(&other));

    index.set_open_chapter(3).unwrap();
    put(&index, &hook, 2);
    put(&index, &other, 3);

    let before = index.stats();
    assert_eq!(index.lookup_name(&hook).unwrap(), Some(2));
    assert_eq!(index.lookup_name(&other).unwrap(), None);
    assert_eq!(index.stats(), before);

    // Out of the window the hook is hidden, but only get_record discards it
    index.set_open_chapter(18).unwrap();
    let before = index.stats();
    assert_eq!(index.lookup_name(&hook).unwrap(), None);
    assert_eq!(index.stats(), before);
    assert_eq!(chapter_of(&index, &hook), None);
    assert_eq!(index.stats().sparse.discard_count, before.sparse.discard_count + 1);
}

#[test]
fn test_sampling_rate_is_respected() {
    let index = VolumeIndex::new(&sparse_config(2)).unwrap();
    let sampled = (0..4000).map(name).filter(|n| index.is_sample(n)).count();
    // One in four, give or take
    assert!((800..1200).contains(&sampled), "sampled {}", sampled);
}

// =============================================================================
// Capacity Tests
// =============================================================================

#[test]
fn test_full_zone_drops_entries_and_expires_early() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();

    let mut stored = Vec::new();
    let mut overflows = 0;
    for i in 0..5000 {
        let n = name(i);
        match put(&index, &n, 0) {
            PutOutcome::Overflow => overflows += 1,
            _ => stored.push(n),
        }
    }
    assert!(overflows > 0);

    let stats = index.stats().combined();
    assert_eq!(stats.overflow_count, overflows);
    assert_eq!(stats.record_count, stored.len() as u64);
    for n in &stored {
        assert_eq!(chapter_of(&index, n), Some(0));
    }

    // The next chapter finds the zone over budget and gives up chapter 0
    index.set_open_chapter(1).unwrap();
    let stats = index.stats().combined();
    assert!(stats.early_flushes >= 1);
    assert_eq!(stats.record_count, 0);
    assert_eq!(stats.discard_count, stored.len() as u64);
}

#[test]
fn test_full_zone_keeps_counters_through_moves_and_removals() {
    let index = VolumeIndex::new(&dense_config(1, 16)).unwrap();

    let mut stored = Vec::new();
    for i in 0..5000 {
        let n = name(i);
        if put(&index, &n, 0) != PutOutcome::Overflow {
            stored.push(n);
        }
    }
    let overflows = index.stats().combined().overflow_count;
    assert!(overflows > 0);

    // Moving keeps list sizes, so a full zone still accepts it
    for n in &stored {
        index.set_record_chapter(0, n, 0).unwrap();
    }
    assert_eq!(index.stats().combined().overflow_count, overflows);

    for (removed, n) in stored.iter().enumerate() {
        assert!(index.remove_record(0, n).unwrap());
        let stats = index.stats().combined();
        assert_eq!(stats.record_count, (stored.len() - removed - 1) as u64);
    }
    let stats = index.stats().combined();
    assert_eq!(stats.overflow_count, overflows);
    assert_eq!(stats.collision_count, 0);
    for n in &stored {
        assert_eq!(chapter_of(&index, n), None);
    }
}
