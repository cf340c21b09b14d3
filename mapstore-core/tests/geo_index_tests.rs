use mapstore_core::geo_index::NODE_SIZE;
use mapstore_core::{
    BoundingBox, GeoIndex, GeoNode, GeoPoint, IndexOptions, MemoryStore, RecordStore, StoreOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tempfile::TempDir;

fn small() -> IndexOptions {
    IndexOptions::for_points().with_batch(512, 16)
}

fn memory_index() -> GeoIndex<MemoryStore> {
    let options = IndexOptions::for_points().with_batch(32, 4);
    GeoIndex::new(MemoryStore::new(NODE_SIZE), options).unwrap()
}

fn brute_force(points: &[(u32, GeoPoint)], bbox: &BoundingBox) -> HashSet<u32> {
    points.iter().filter(|(_, p)| bbox.contains(*p)).map(|(r, _)| *r).collect()
}

fn random_box(rng: &mut StdRng, span: i64) -> BoundingBox {
    let a = rng.random_range(-span..=span);
    let b = rng.random_range(-span..=span);
    let c = rng.random_range(-span..=span);
    let d = rng.random_range(-span..=span);
    BoundingBox::new(a.min(b), c.min(d), a.max(b), c.max(d))
}

#[test]
fn test_queries_match_brute_force() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut index = GeoIndex::new(MemoryStore::new(NODE_SIZE), small()).unwrap();

    // Narrow coordinate range so plenty of keys tie
    let mut points = Vec::new();
    for record in 0..2000u32 {
        let point = GeoPoint::new(rng.random_range(-1000..=1000), rng.random_range(-1000..=1000));
        index.put(record, point.lat, point.lon).unwrap();
        points.push((record, point));
    }

    for _ in 0..100 {
        let bbox = random_box(&mut rng, 1100);
        assert_eq!(index.query(&bbox).unwrap(), brute_force(&points, &bbox), "box {:?}", bbox);
    }

    let everything = BoundingBox::new(i64::MIN, i64::MIN, i64::MAX, i64::MAX);
    assert_eq!(index.query(&everything).unwrap().len(), 2000);
}

#[test]
fn test_queries_after_removal_match_brute_force() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut index = GeoIndex::new(MemoryStore::new(NODE_SIZE), small()).unwrap();

    let mut points = Vec::new();
    for record in 0..500u32 {
        let point = GeoPoint::new(rng.random_range(-500..=500), rng.random_range(-500..=500));
        index.put(record, point.lat, point.lon).unwrap();
        points.push((record, point));
    }

    let (removed, kept): (Vec<_>, Vec<_>) =
        points.iter().copied().partition(|(record, _)| record % 3 == 0);
    for (record, point) in &removed {
        assert!(index.remove(*record, point.lat, point.lon).unwrap());
    }

    for _ in 0..50 {
        let bbox = random_box(&mut rng, 600);
        assert_eq!(index.query(&bbox).unwrap(), brute_force(&kept, &bbox));
    }
}

#[test]
fn test_duplicate_points_are_all_returned() {
    let mut index = memory_index();
    for record in 0..5u32 {
        index.put(record, 7, 7).unwrap();
    }
    assert_eq!(index.range_query(7, 7, 7, 7).unwrap(), (0..5).collect::<HashSet<u32>>());
}

#[test]
fn test_reinserting_removed_point_uses_new_node() {
    let mut index = memory_index();
    index.put(1, 5, 5).unwrap();
    assert!(index.remove(1, 5, 5).unwrap());
    index.put(1, 5, 5).unwrap();

    assert_eq!(index.range_query(0, 0, 10, 10).unwrap(), HashSet::from([1]));

    // Removal never frees nodes
    let occupied = (0..index.record_count())
        .filter(|&r| !GeoNode::from_bytes(&index.store().read(r).unwrap()).unwrap().is_empty())
        .count();
    assert_eq!(occupied, 2);
}

#[test]
fn test_self_referencing_child_is_skipped_and_repaired() {
    let mut index = memory_index();
    index.put(1, 50, 50).unwrap();

    let mut root = GeoNode::from_bytes(&index.store().read(0).unwrap()).unwrap();
    root.left = 0;
    index.store_mut().write(0, &root.to_bytes()).unwrap();

    // Query terminates and still sees the root
    assert_eq!(index.range_query(0, 0, 100, 100).unwrap(), HashSet::from([1]));

    // An insert through the broken link replaces it with a real child
    index.put(2, 10, 10).unwrap();
    let root = GeoNode::from_bytes(&index.store().read(0).unwrap()).unwrap();
    assert!(root.left > 0);
    assert_eq!(index.range_query(0, 0, 100, 100).unwrap(), HashSet::from([1, 2]));
}

#[test]
fn test_longer_cycle_is_an_error() {
    let mut index = memory_index();
    index.put(1, 50, 50).unwrap();
    index.put(2, 40, 40).unwrap();

    let root = GeoNode::from_bytes(&index.store().read(0).unwrap()).unwrap();
    let child = u32::try_from(root.left).unwrap();
    let mut node = GeoNode::from_bytes(&index.store().read(child).unwrap()).unwrap();
    node.right = 0;
    index.store_mut().write(child, &node.to_bytes()).unwrap();

    let err = index.range_query(0, 0, 100, 100).unwrap_err();
    assert!(err.to_string().contains("cycle"));

    let err = index.put(3, 45, 45).unwrap_err();
    assert!(err.to_string().contains("cycle"));
}

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("points.idx");

    {
        let mut index = GeoIndex::open(&path, StoreOptions::default(), small()).unwrap();
        for i in 0..200i64 {
            index.put(i as u32, i * 1000, -i * 1000).unwrap();
        }
        index.flush().unwrap();
    }

    let mut index = GeoIndex::open(&path, StoreOptions::default(), small()).unwrap();
    let found = index.range_query(0, -49_000, 49_000, 0).unwrap();
    assert_eq!(found, (0..50).collect::<HashSet<u32>>());

    // New points after reopen do not overwrite existing nodes
    index.put(500, 25_500, -25_500).unwrap();
    let found = index.range_query(25_000, -26_000, 26_000, -25_000).unwrap();
    assert_eq!(found, HashSet::from([25, 26, 500]));
    assert_eq!(index.range_query(i64::MIN, i64::MIN, i64::MAX, i64::MAX).unwrap().len(), 201);
}

#[test]
fn test_unmapped_store() {
    let dir = TempDir::new().unwrap();
    let mut index =
        GeoIndex::open(dir.path().join("points.idx"), StoreOptions::unmapped(), small()).unwrap();
    assert!(!index.store().is_mapped());

    index.put(5, 10_000_000, 20_000_000).unwrap();
    index.put(6, 10_000_050, 20_000_050).unwrap();

    let found = index.range_query(9_999_990, 19_999_990, 10_000_010, 20_000_010).unwrap();
    assert_eq!(found, HashSet::from([5]));
}

#[test]
fn test_extreme_coordinates() {
    let mut index = memory_index();
    index.put(1, i64::MAX, i64::MAX).unwrap();
    index.put(2, i64::MIN + 1, i64::MIN).unwrap();
    index.put(3, 0, 0).unwrap();

    let all = index.range_query(i64::MIN, i64::MIN, i64::MAX, i64::MAX).unwrap();
    assert_eq!(all, HashSet::from([1, 2, 3]));
    assert_eq!(index.range_query(1, 1, i64::MAX, i64::MAX).unwrap(), HashSet::from([1]));
}
