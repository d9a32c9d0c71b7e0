//! Tests for the delta list codec
//!
//! These tests verify:
//! - Bit streams round fields across byte boundaries
//! - The delta code sizes every delta exactly
//! - General and octet codes decode to the same entries
//! - Truncated or out-of-range lists are rejected
//! - Collision entries are found by name
//! - Zone arenas keep every list intact while rebalancing

use dedupe_index::delta::{
    search, BitReader, BitWriter, DeltaCode, DeltaEntry, DeltaZone, ListCode, ListCodec,
    OpenDeltaList, StoreOutcome,
};
use dedupe_index::RecordName;

// =============================================================================
// Helper Functions
// =============================================================================

fn name(i: u64) -> RecordName {
    RecordName::from_data(&i.to_le_bytes())
}

/// Sorted entries with a collision every `collision_every` entries
fn sample_entries(count: u64, key_bits: u32, collision_every: u64) -> Vec<DeltaEntry> {
    let mut list = OpenDeltaList::new();
    for i in 0..count {
        let key = name(i).volume_index_bytes() >> (64 - key_bits);
        list.merge(key, (i % 16) as u32, &name(i));
        if collision_every > 0 && i % collision_every == 0 {
            list.merge(key, ((i + 1) % 16) as u32, &name(i + 1_000_000));
        }
    }
    list.entries().to_vec()
}

/// Entries ending with a collision, so any truncation cuts into a name
fn entries_ending_in_collision(key_bits: u32) -> Vec<DeltaEntry> {
    let mut entries = sample_entries(40, key_bits, 0);
    let last_key = entries[entries.len() - 1].key;
    entries.push(DeltaEntry {
        key: last_key,
        value: 3,
        name: Some(name(99)),
    });
    entries
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
}

// =============================================================================
// Bit Stream Tests
// =============================================================================

#[test]
fn test_bit_stream_mixed_widths() {
    let widths = [1u32, 3, 7, 8, 13, 32, 64, 5];
    let mut writer = BitWriter::new();
    for (i, width) in widths.iter().enumerate() {
        let value = if *width == 64 { u64::MAX - i as u64 } else { (1u64 << width) - 1 - i as u64 % 2 };
        writer.write(value, *width);
    }
    writer.write_zeros(11);
    writer.write(1, 1);
    let (bytes, bits) = writer.into_parts();
    assert_eq!(bits, widths.iter().map(|w| u64::from(*w)).sum::<u64>() + 12);

    let mut reader = BitReader::new(&bytes, bits).unwrap();
    for (i, width) in widths.iter().enumerate() {
        let expected = if *width == 64 { u64::MAX - i as u64 } else { (1u64 << width) - 1 - i as u64 % 2 };
        assert_eq!(reader.read(*width).unwrap(), expected);
    }
    assert_eq!(reader.read_unary().unwrap(), 11);
    assert!(reader.at_end());
    assert!(reader.read(1).is_err());
}

#[test]
fn test_bit_reader_rejects_oversized_length() {
    assert!(BitReader::new(&[0u8; 2], 17).unwrap_err().is_format());
}

#[test]
fn test_unary_run_past_end_is_rejected() {
    let bytes = [0u8, 0, 0x01];
    let mut reader = BitReader::new(&bytes, 16).unwrap();
    assert!(reader.read_unary().is_err());
}

// =============================================================================
// Delta Code Tests
// =============================================================================

#[test]
fn test_delta_code_sizes_match_stream() {
    for mean in [1u32, 100, 4096, 1 << 16] {
        let code = DeltaCode::new(mean);
        let deltas: Vec<u64> = (0..200u64).map(|i| i * i * u64::from(mean) / 37).collect();

        let mut writer = BitWriter::new();
        let mut expected = 0;
        for delta in &deltas {
            code.encode(&mut writer, *delta);
            expected += code.bits_for(*delta);
        }
        let (bytes, bits) = writer.into_parts();
        assert_eq!(bits, expected, "mean {}", mean);

        let mut reader = BitReader::new(&bytes, bits).unwrap();
        for delta in &deltas {
            assert_eq!(code.decode(&mut reader).unwrap(), *delta, "mean {}", mean);
        }
        assert!(reader.at_end());
    }
}

#[test]
fn test_small_deltas_use_minimum_bits() {
    let code = DeltaCode::new(4096);
    assert_eq!(code.bits_for(0), u64::from(code.min_bits()));
    assert_eq!(code.bits_for(1), u64::from(code.min_bits()));
    assert!(code.bits_for(1 << 20) > u64::from(code.min_bits()));
}

// =============================================================================
// List Codec Tests
// =============================================================================

#[test]
fn test_general_and_octet_codes_agree() {
    let codec = ListCodec::new(1 << 16, 22, 4);
    let entries = sample_entries(120, 22, 9);
    assert!(entries.iter().any(DeltaEntry::is_collision));

    let (general, general_bits) = codec.encode(&entries, ListCode::General);
    let (octet, octet_bits) = codec.encode(&entries, ListCode::Octet);
    assert_eq!(octet_bits % 8, 0);

    assert_eq!(codec.decode(&general, general_bits, ListCode::General).unwrap(), entries);
    assert_eq!(codec.decode(&octet, octet_bits, ListCode::Octet).unwrap(), entries);
}

#[test]
fn test_encoded_bits_predicts_encoding() {
    let codec = ListCodec::new(4096, 20, 5);
    let entries = sample_entries(64, 20, 5);
    for code in [ListCode::General, ListCode::Octet] {
        let (_, bits) = codec.encode(&entries, code);
        assert_eq!(codec.encoded_bits(&entries, code), bits, "{:?}", code);
    }
}

#[test]
fn test_empty_list_decodes_empty() {
    let codec = ListCodec::new(4096, 20, 5);
    for code in [ListCode::General, ListCode::Octet] {
        let (bytes, bits) = codec.encode(&[], code);
        assert_eq!(bits, 0);
        assert!(codec.decode(&bytes, bits, code).unwrap().is_empty());
    }
}

#[test]
fn test_list_code_threshold() {
    assert_eq!(ListCode::for_len(32), ListCode::General);
    assert_eq!(ListCode::for_len(33), ListCode::Octet);
    assert_eq!(ListCode::from_u8(1).unwrap(), ListCode::Octet);
    assert!(ListCode::from_u8(7).unwrap_err().is_format());
}

#[test]
fn test_truncated_general_list_is_rejected() {
    let codec = ListCodec::new(4096, 20, 5);
    let entries = entries_ending_in_collision(20);
    let (bytes, bits) = codec.encode(&entries, ListCode::General);

    let err = codec.decode(&bytes, bits - 8, ListCode::General).unwrap_err();
    assert!(err.is_format());
}

#[test]
fn test_truncated_octet_list_is_rejected() {
    let codec = ListCodec::new(4096, 20, 5);
    let entries = entries_ending_in_collision(20);
    let (bytes, bits) = codec.encode(&entries, ListCode::Octet);

    assert!(codec.decode(&bytes, bits - 8, ListCode::Octet).is_err());
    assert!(codec.decode(&bytes, bits - 3, ListCode::Octet).is_err());
}

#[test]
fn test_key_wider_than_codec_is_rejected() {
    let wide = ListCodec::new(4096, 16, 5);
    let narrow = ListCodec::new(4096, 12, 5);
    let entries = vec![DeltaEntry::new(5, 1), DeltaEntry::new(5000, 2)];

    let (bytes, bits) = wide.encode(&entries, ListCode::Octet);
    assert!(narrow.decode(&bytes, bits, ListCode::Octet).is_err());
}

// =============================================================================
// Search Tests
// =============================================================================

#[test]
fn test_search_prefers_named_collision() {
    let mut list = OpenDeltaList::new();
    list.append(10, 1, &name(1));
    list.append(20, 2, &name(2));
    list.append(20, 3, &name(3));
    list.append(20, 4, &name(4));
    list.append(30, 5, &name(5));
    let entries = list.entries();

    assert_eq!(search(entries, 20, &name(3)), Some((2, true)));
    assert_eq!(search(entries, 20, &name(4)), Some((3, true)));
    // An unnamed match falls back to the primary entry for the key
    assert_eq!(search(entries, 20, &name(2)), Some((1, false)));
    assert_eq!(search(entries, 20, &name(77)), Some((1, false)));
    assert_eq!(search(entries, 25, &name(2)), None);
    assert_eq!(search(entries, 40, &name(5)), None);
}

#[test]
fn test_open_list_append_out_of_order_merges() {
    let mut list = OpenDeltaList::new();
    list.append(50, 0, &name(0));
    list.append(10, 1, &name(1));
    list.append(50, 2, &name(2));
    list.append(30, 3, &name(3));

    let keys: Vec<u64> = list.entries().iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![10, 30, 50, 50]);
    assert_eq!(list.entries()[3].name, Some(name(2)));
    assert!(list.entries()[2].name.is_none());

    list.truncate(2);
    assert_eq!(list.len(), 2);
    list.clear();
    assert!(list.is_empty());
}

// =============================================================================
// Zone Arena Tests
// =============================================================================

#[test]
fn test_zone_keeps_every_list_through_rebalances() {
    let lists = 16u32;
    let mut zone = DeltaZone::new(100, lists, 1024);
    let mut expected: Vec<Vec<u8>> = vec![Vec::new(); lists as usize];

    for round in 1..=6usize {
        for list in 0..lists {
            let len = round * 3 * (1 + list as usize % 4);
            let data = pattern(len, (round * 16) as u8 + list as u8);
            let outcome = zone.store(100 + list, &data, len as u64 * 8);
            assert_ne!(outcome, StoreOutcome::Overflow);
            expected[list as usize] = data;
        }
        for list in 0..lists {
            assert_eq!(zone.list(100 + list).0, &expected[list as usize][..]);
        }
    }
    assert!(zone.rebalance_count() > 0);
    assert!(zone.owns(115));
    assert!(!zone.owns(116));
}

#[test]
fn test_zone_overflow_reports_and_keeps_state() {
    let mut zone = DeltaZone::new(0, 4, 64);
    for list in 0..4 {
        zone.store(list, &pattern(12, list as u8), 96);
    }
    let used = zone.used_bits();

    assert_eq!(zone.store(2, &pattern(40, 9), 320), StoreOutcome::Overflow);
    assert_eq!(zone.used_bits(), used);
    assert_eq!(zone.list(2).0, &pattern(12, 2)[..]);
}
