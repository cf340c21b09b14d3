//! Integration tests for the MapIndex facade
//!
//! Tests cover the complete lifecycle: open -> register -> lookup/within -> flush -> reopen

use mapstore_core::{
    BoundingBox, GeoPoint, IndexOptions, MapIndex, MapIndexOptions, NO_ATTRIBUTE, StoreOptions,
    UNKNOWN_KEY,
};
use std::collections::HashSet;
use tempfile::TempDir;

fn options(store: StoreOptions) -> MapIndexOptions {
    MapIndexOptions {
        store,
        ids: IndexOptions::for_ids().with_batch(1024, 64),
        points: IndexOptions::for_points().with_batch(256, 16),
    }
}

#[test]
fn test_index_lifecycle_basic() {
    let dir = TempDir::new().unwrap();

    // Create index
    let mut index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();
    assert_eq!(index.dir(), dir.path());
    assert_eq!(index.lookup(1).unwrap(), None);

    // Register a node with a location and a way without one
    index.register(1001, 0, Some(GeoPoint::new(515_000_000, -1_200_000))).unwrap();
    index.register(1002, 1, Some(GeoPoint::new(515_000_100, -1_200_100))).unwrap();
    index.register(9_000_000_000, 2, None).unwrap();

    assert_eq!(index.lookup(1001).unwrap(), Some(0));
    assert_eq!(index.lookup(1002).unwrap(), Some(1));
    assert_eq!(index.lookup(9_000_000_000).unwrap(), Some(2));

    // Area query
    let bbox = BoundingBox::new(514_999_990, -1_200_010, 515_000_010, -1_199_990);
    let found = index.within(&bbox).unwrap();
    assert_eq!(found, HashSet::from([0]));

    // Flush
    index.flush().unwrap();
}

#[test]
fn test_index_persistence() {
    let dir = TempDir::new().unwrap();

    // Create and populate
    {
        let mut index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();
        for i in 0..500u32 {
            let point = GeoPoint::new(i64::from(i % 50) * 100, i64::from(i / 50) * 100);
            index.register(u64::from(i) << 24, i, Some(point)).unwrap();
        }
        index.attributes().get_or_create_key("highway").unwrap();
        index.attributes().get_or_create_key("name").unwrap();
        index.close().unwrap();
    }

    // Reopen and verify
    {
        let index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();
        for i in 0..500u32 {
            assert_eq!(index.lookup(u64::from(i) << 24).unwrap(), Some(i));
        }

        // Selects i % 50 <= 2 and i / 50 <= 1
        let found = index.within(&BoundingBox::new(0, 0, 200, 100)).unwrap();
        assert_eq!(found, HashSet::from([0, 1, 2, 50, 51, 52]));

        assert_eq!(index.attributes().get_key("highway"), 1);
        assert_eq!(index.attributes().get_key("name"), 2);
        assert_eq!(index.attributes().attribute_name(2).as_deref(), Some("name"));
    }
}

#[test]
fn test_index_unmapped_mode() {
    let dir = TempDir::new().unwrap();
    let mut index = MapIndex::open(dir.path(), options(StoreOptions::unmapped())).unwrap();

    for i in 0..100u32 {
        let point = GeoPoint::new(i64::from(i), i64::from(i));
        index.register(u64::from(i) * 31, i, Some(point)).unwrap();
    }

    assert!(!index.ids().store().is_mapped());
    assert!(!index.points().store().is_mapped());
    assert_eq!(index.lookup(31 * 42).unwrap(), Some(42));
    let found = index.within(&BoundingBox::new(10, 10, 12, 12)).unwrap();
    assert_eq!(found, HashSet::from([10, 11, 12]));
}

#[test]
fn test_index_degrades_when_mapping_limit_is_reached() {
    let dir = TempDir::new().unwrap();
    // Room for the first growth step only
    let store = StoreOptions { map_limit: 64 * 1024, ..StoreOptions::default() };
    let mut index = MapIndex::open(dir.path(), options(store)).unwrap();

    index.register(1, 1, None).unwrap();
    assert!(index.ids().store().is_mapped());

    for i in 0..2000u64 {
        index.register(i << 32, i as u32, None).unwrap();
    }
    assert!(!index.ids().store().is_mapped());

    for i in 0..2000u64 {
        assert_eq!(index.lookup(i << 32).unwrap(), Some(i as u32));
    }
    assert_eq!(index.lookup(1).unwrap(), Some(1));
}

#[test]
fn test_index_unregister() {
    let dir = TempDir::new().unwrap();
    let mut index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();
    let point = GeoPoint::new(10, 20);

    index.register(5, 50, Some(point)).unwrap();
    index.register(6, 60, Some(point)).unwrap();

    assert!(index.unregister(5, 50, Some(point)).unwrap());
    assert_eq!(index.lookup(5).unwrap(), None);
    assert_eq!(index.lookup(6).unwrap(), Some(60));
    assert_eq!(index.within(&BoundingBox::new(10, 20, 10, 20)).unwrap(), HashSet::from([60]));

    // Unknown IDs report false and change nothing
    assert!(!index.unregister(12345, 0, None).unwrap());
}

#[test]
fn test_index_attributes() {
    let dir = TempDir::new().unwrap();
    let index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();
    let attributes = index.attributes();

    assert_eq!(attributes.get_key("surface"), UNKNOWN_KEY);
    assert_eq!(attributes.get_or_create_key("").unwrap(), NO_ATTRIBUTE);

    let key = attributes.get_or_create_key("surface").unwrap();
    assert_eq!(attributes.get_key("surface"), key);
    assert_eq!(attributes.len(), 1);
}

#[test]
fn test_index_rejects_out_of_range_input() {
    let dir = TempDir::new().unwrap();
    let mut index = MapIndex::open(dir.path(), options(StoreOptions::default())).unwrap();

    assert!(index.register(u64::MAX, 1, None).is_err());
    assert!(index.register(1, u32::MAX, None).is_err());
    assert!(index.register(1, 1, Some(GeoPoint::new(i64::MIN, i64::MIN))).is_err());
    assert_eq!(index.lookup(u64::MAX).unwrap(), None);
}

#[test]
fn test_index_creates_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a").join("b");

    let mut index = MapIndex::open(&nested, options(StoreOptions::default())).unwrap();
    index.register(1, 1, None).unwrap();
    index.flush().unwrap();

    assert!(nested.join(mapstore_core::ID_INDEX_FILE).exists());
}
