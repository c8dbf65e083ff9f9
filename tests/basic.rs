use ahash::AHasher;
use tagged_cuckoo_map::{CuckooMap, CuckooMapBuilder};

// Helper function to create test data
fn test_items(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("test_item_{i}")).collect()
}

#[test]
fn test_new_map() {
    let map: CuckooMap<u64, u64> = CuckooMap::new();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    // Default capacity of 131072, doubled for load-factor headroom.
    assert_eq!(map.capacity(), 262144);
}

#[test]
fn test_with_capacity() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1000);
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    // 1000 keys round up to 256 buckets, which 1000 keys would load past
    // 0.96, so the bucket count doubles: 512 buckets of 4 slots.
    assert_eq!(map.capacity(), 2048);
}

#[test]
fn test_tiny_capacity_hints() {
    // A hint of 0 or 1 still builds a valid single-bucket map.
    for hint in [0, 1] {
        let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(hint);
        assert_eq!(map.capacity(), 4);
        assert!(map.insert(9, 90).is_ok());
        assert_eq!(map.get(&9), Some(90));
    }
}

#[test]
fn test_builder_default() {
    let map: CuckooMap<String, u64> = CuckooMap::builder().build().unwrap();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
}

#[test]
fn test_builder_custom_config() {
    let map: CuckooMap<u64, u64> = CuckooMap::builder()
        .capacity(2048)
        .bits_per_tag(8)
        .max_kicks(100)
        .seed(42)
        .build()
        .unwrap();

    assert_eq!(map.len(), 0);
    // A full power-of-two request always doubles for headroom.
    assert_eq!(map.capacity(), 4096);
}

#[test]
fn test_builder_validation_invalid_bits_per_tag() {
    for bits in [0, 17, 32] {
        let result = CuckooMap::<u64, u64>::builder().bits_per_tag(bits).build();

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("bits_per_tag must be between 1 and 16")
        );
    }
}

#[test]
fn test_builder_validation_zero_max_kicks() {
    let result = CuckooMap::<u64, u64>::builder().max_kicks(0).build();

    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("max_kicks must be greater than zero")
    );
}

#[test]
fn test_empty_map_operations() {
    let mut map: CuckooMap<String, u64> = CuckooMap::with_capacity(1024);

    assert_eq!(map.get(&"nonexistent".to_string()), None);
    assert!(!map.contains(&"nonexistent".to_string()));
    assert!(!map.may_contain(&"nonexistent".to_string()));
    assert!(!map.remove(&"nonexistent".to_string()));
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
}

#[test]
fn test_basic_insert_get_remove() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);

    assert!(map.insert(1, 100).is_ok());
    assert_eq!(map.get(&1), Some(100));
    assert_eq!(map.get(&2), None);
    assert_eq!(map.len(), 1);
    assert!(!map.is_empty());

    assert!(map.remove(&1));
    assert_eq!(map.get(&1), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn test_two_keys_any_order() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);

    assert!(map.insert(7, 70).is_ok());
    assert!(map.insert(42, 42).is_ok());

    assert_eq!(map.get(&42), Some(42));
    assert_eq!(map.get(&7), Some(70));
    assert_eq!(map.get(&7), Some(70));
    assert_eq!(map.get(&42), Some(42));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_insert_duplicate_keys() {
    let mut map: CuckooMap<String, u64> = CuckooMap::with_capacity(1024);
    let key = "duplicate_item".to_string();

    // Duplicates are stored as independent entries.
    assert!(map.insert(key.clone(), 1).is_ok());
    assert!(map.insert(key.clone(), 2).is_ok());
    assert_eq!(map.len(), 2);
    assert!(map.contains(&key));

    // A removal deletes every reachable copy of the key.
    assert!(map.remove(&key));
    assert_eq!(map.get(&key), None);
    assert_eq!(map.len(), 0);
    assert!(!map.remove(&key));
}

#[test]
fn test_idempotent_remove() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);

    assert!(map.insert(5, 55).is_ok());
    assert!(map.remove(&5));
    assert!(!map.remove(&5));
}

#[test]
fn test_reinsert_after_remove() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);

    assert!(map.insert(11, 1).is_ok());
    assert!(map.remove(&11));
    assert!(map.insert(11, 2).is_ok());
    assert_eq!(map.get(&11), Some(2));
}

#[test]
fn test_len_tracks_inserts_and_removes() {
    let mut map: CuckooMap<String, u64> = CuckooMap::with_capacity(1024);
    let items = test_items(100);

    for (i, item) in items.iter().enumerate() {
        assert!(map.insert(item.clone(), i as u64).is_ok());
        assert_eq!(map.len(), i + 1);
    }
    for (i, item) in items.iter().enumerate() {
        assert!(map.remove(item));
        assert_eq!(map.len(), items.len() - i - 1);
    }
    assert!(map.is_empty());
}

#[test]
fn test_no_false_negatives_large_stream() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::builder()
        .capacity(131072)
        .bits_per_tag(12)
        .seed(42)
        .build()
        .unwrap();

    // Insert a stream of distinct keys and keep the ones that were accepted
    // (at this load every insert is expected to succeed).
    let inserted: Vec<u64> = (0..100_000u64)
        .filter(|&key| map.insert(key, key.wrapping_mul(3)).is_ok())
        .collect();
    assert_eq!(inserted.len(), 100_000);
    assert_eq!(map.len(), inserted.len());

    for &key in &inserted {
        assert_eq!(map.get(&key), Some(key.wrapping_mul(3)), "lost key {key}");
    }

    // Exact lookups never report unseen keys, no matter how many
    // fingerprints alias.
    let phantom_hits = (1_000_000..1_100_000u64)
        .filter(|key| map.get(key).is_some())
        .count();
    assert_eq!(phantom_hits, 0);
}

#[test]
fn test_different_key_types() {
    let mut string_map: CuckooMap<String, u64> = CuckooMap::with_capacity(1024);
    assert!(string_map.insert("string".to_string(), 1).is_ok());
    assert_eq!(string_map.get(&"string".to_string()), Some(1));

    let mut pair_map: CuckooMap<(u32, u32), u64> = CuckooMap::with_capacity(1024);
    assert!(pair_map.insert((1, 2), 3).is_ok());
    assert_eq!(pair_map.get(&(1, 2)), Some(3));
    assert_eq!(pair_map.get(&(2, 1)), None);
}

#[test]
fn test_custom_hasher() {
    // Test that we can use different hashers
    let mut map = CuckooMapBuilder::<String, u64, AHasher>::default()
        .capacity(1024)
        .build()
        .unwrap();

    let items = test_items(100);
    for (i, item) in items.iter().enumerate() {
        assert!(map.insert(item.clone(), i as u64).is_ok());
    }

    for (i, item) in items.iter().enumerate() {
        assert_eq!(map.get(item), Some(i as u64));
    }

    assert_eq!(map.len(), 100);
}

#[test]
fn test_size_in_bytes() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);
    // 512 buckets after headroom doubling, one 64-bit word each.
    assert_eq!(map.size_in_bytes(), 512 * 8);
}

#[test]
fn test_info() {
    let mut map: CuckooMap<u64, u64> = CuckooMap::with_capacity(1024);

    let info = map.info();
    assert!(info.contains("keys stored: 0"));
    assert!(info.contains("bits/key: n/a"));

    for key in 0..32u64 {
        assert!(map.insert(key, key).is_ok());
    }
    let info = map.info();
    assert!(info.contains("keys stored: 32"));
    assert!(info.contains("load factor"));
    assert!(!info.contains("n/a"));
}
