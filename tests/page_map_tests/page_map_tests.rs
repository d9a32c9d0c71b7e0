//! Tests for the index page map
//!
//! These tests verify:
//! - Page lookups are monotonic in the delta list number
//! - The last page covers the highest lists
//! - Page bounds agree with page lookups
//! - Write then read preserves every threshold and the last update
//! - Corrupt, truncated, foreign and non-monotonic maps are rejected

use dedupe_index::geometry::Geometry;
use dedupe_index::page_map::IndexPageMap;
use dedupe_index::RecordName;

// =============================================================================
// Helper Functions
// =============================================================================

/// Three index pages and 32 delta lists per chapter
fn geometry() -> Geometry {
    let geometry = Geometry::new(4096, 16, 8, 0).unwrap();
    assert_eq!(geometry.index_pages_per_chapter, 3);
    assert_eq!(geometry.delta_lists_per_chapter, 32);
    geometry
}

/// A name whose chapter delta list is `list`
fn name_in_list(geometry: &Geometry, list: u32) -> RecordName {
    let bytes48 = u64::from(list) << geometry.chapter_address_bits;
    let mut bytes = [0x5au8; 16];
    bytes[8..10].copy_from_slice(&((bytes48 >> 32) as u16).to_be_bytes());
    bytes[10..14].copy_from_slice(&(bytes48 as u32).to_be_bytes());
    let name = RecordName(bytes);
    assert_eq!(name.chapter_delta_list(geometry), list);
    name
}

/// Thresholds of the first two pages of `chapter`
fn thresholds(chapter: u32) -> (u32, u32) {
    (3 + chapter, 14 + 2 * chapter)
}

/// A map with every chapter written, chapter `c` as virtual chapter `8 + c`
fn populated(geometry: &Geometry) -> IndexPageMap {
    let mut map = IndexPageMap::new(geometry);
    for chapter in 0..geometry.chapters_per_volume {
        let (first, second) = thresholds(chapter);
        let virtual_chapter = 8 + u64::from(chapter);
        map.update(virtual_chapter, chapter, 0, first).unwrap();
        map.update(virtual_chapter, chapter, 1, second).unwrap();
        map.update(virtual_chapter, chapter, 2, 31).unwrap();
    }
    map
}

fn saved(map: &IndexPageMap) -> Vec<u8> {
    let mut buf = Vec::new();
    map.write(&mut buf).unwrap();
    buf
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_lookup_is_monotonic_per_chapter() {
    let geometry = geometry();
    let map = populated(&geometry);

    for chapter in 0..geometry.chapters_per_volume {
        let (first, second) = thresholds(chapter);
        let mut previous = 0;
        for list in 0..geometry.delta_lists_per_chapter {
            let page = map
                .find_index_page_number(&name_in_list(&geometry, list), chapter)
                .unwrap();
            assert!(page >= previous, "chapter {} list {}", chapter, list);
            let expected = if list <= first {
                0
            } else if list <= second {
                1
            } else {
                2
            };
            assert_eq!(page, expected, "chapter {} list {}", chapter, list);
            previous = page;
        }
        assert_eq!(previous, geometry.index_pages_per_chapter - 1);
    }
}

#[test]
fn test_bounds_match_lookups() {
    let geometry = geometry();
    let map = populated(&geometry);

    for chapter in 0..geometry.chapters_per_volume {
        let mut next_low = 0;
        for page in 0..geometry.index_pages_per_chapter {
            let (low, high) = map.list_number_bounds(chapter, page).unwrap();
            assert_eq!(low, next_low);
            assert!(low <= high);
            for list in [low, high] {
                let name = name_in_list(&geometry, list);
                assert_eq!(map.find_index_page_number(&name, chapter).unwrap(), page);
            }
            next_low = high + 1;
        }
        assert_eq!(next_low, geometry.delta_lists_per_chapter);
    }
}

#[test]
fn test_fresh_map_sends_everything_to_first_page() {
    let geometry = geometry();
    let map = IndexPageMap::new(&geometry);
    assert_eq!(map.last_update(), 0);
    for list in [0, 17, 31] {
        let name = name_in_list(&geometry, list);
        assert_eq!(map.find_index_page_number(&name, 5).unwrap(), 0);
    }
}

#[test]
fn test_last_update_tracks_newest_chapter() {
    let geometry = geometry();
    let mut map = populated(&geometry);
    assert_eq!(map.last_update(), 15);

    // Rewriting chapter 0 as virtual chapter 16
    map.update(16, 0, 0, 1).unwrap();
    map.update(16, 0, 1, 2).unwrap();
    map.update(16, 0, 2, 31).unwrap();
    assert_eq!(map.last_update(), 16);
    assert_eq!(map.list_number_bounds(0, 1).unwrap(), (2, 2));
    assert_eq!(map.list_number_bounds(0, 2).unwrap(), (3, 31));
}

#[test]
fn test_out_of_range_lookups_are_rejected() {
    let geometry = geometry();
    let map = populated(&geometry);
    let name = name_in_list(&geometry, 0);
    assert!(map.find_index_page_number(&name, 8).is_err());
    assert!(map.list_number_bounds(0, 3).is_err());
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_write_read_round_trip() {
    let geometry = geometry();
    let map = populated(&geometry);
    let buf = saved(&map);
    assert_eq!(buf.len() as u64, IndexPageMap::compute_save_size(&geometry));

    let restored = IndexPageMap::read(&geometry, &mut buf.as_slice()).unwrap();
    assert_eq!(restored.last_update(), map.last_update());
    for chapter in 0..geometry.chapters_per_volume {
        for page in 0..geometry.index_pages_per_chapter {
            assert_eq!(
                restored.list_number_bounds(chapter, page).unwrap(),
                map.list_number_bounds(chapter, page).unwrap()
            );
        }
    }
}

#[test]
fn test_trailing_bytes_are_ignored() {
    let geometry = geometry();
    let map = populated(&geometry);
    let mut buf = saved(&map);
    buf.extend_from_slice(&[0u8; 100]);

    let restored = IndexPageMap::read(&geometry, &mut buf.as_slice()).unwrap();
    assert_eq!(restored.last_update(), map.last_update());
}

#[test]
fn test_corrupt_map_is_rejected() {
    let geometry = geometry();
    let mut buf = saved(&populated(&geometry));
    buf[30] ^= 0x01;
    let err = IndexPageMap::read(&geometry, &mut buf.as_slice()).unwrap_err();
    assert!(err.is_format());
}

#[test]
fn test_truncated_map_is_rejected() {
    let geometry = geometry();
    let buf = saved(&populated(&geometry));
    let short = &buf[..buf.len() - 6];
    assert!(IndexPageMap::read(&geometry, &mut &short[..]).unwrap_err().is_format());
}

#[test]
fn test_bad_magic_is_rejected() {
    let geometry = geometry();
    let mut buf = saved(&populated(&geometry));
    buf[0] = b'X';
    assert!(IndexPageMap::read(&geometry, &mut buf.as_slice()).unwrap_err().is_format());
}

#[test]
fn test_other_geometry_is_rejected() {
    let geometry = geometry();
    let buf = saved(&populated(&geometry));
    let other = Geometry::new(4096, 16, 16, 0).unwrap();
    assert!(IndexPageMap::read(&other, &mut buf.as_slice()).unwrap_err().is_format());
}

#[test]
fn test_non_monotonic_map_is_rejected() {
    let geometry = geometry();
    let mut map = populated(&geometry);
    map.update(20, 4, 0, 20).unwrap();
    map.update(20, 4, 1, 10).unwrap();

    let buf = saved(&map);
    assert!(IndexPageMap::read(&geometry, &mut buf.as_slice()).unwrap_err().is_format());
}
