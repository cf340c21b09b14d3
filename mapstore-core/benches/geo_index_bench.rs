use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mapstore_core::{BoundingBox, GeoIndex, IndexOptions, StoreOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::TempDir;

/// Fixed-point degrees (1e-7) around a city-sized area
const CENTER_LAT: i64 = 515_000_000;
const CENTER_LON: i64 = -1_200_000;
const SPREAD: i64 = 5_000_000;

fn build_index(dir: &TempDir, count: u32) -> GeoIndex {
    let options = IndexOptions::for_points().with_batch(65_536, 4096);
    let mut index =
        GeoIndex::open(dir.path().join("points.idx"), StoreOptions::default(), options).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    for record in 0..count {
        let lat = CENTER_LAT + rng.random_range(-SPREAD..=SPREAD);
        let lon = CENTER_LON + rng.random_range(-SPREAD..=SPREAD);
        index.put(record, lat, lon).unwrap();
    }
    index
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("geo_put");
    group.sample_size(10);

    for count in [1_000u32, 20_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                black_box(build_index(&temp_dir, count).record_count());
            });
        });
    }

    group.finish();
}

fn bench_range_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("geo_range_query");
    group.sample_size(100);

    let temp_dir = TempDir::new().unwrap();
    let index = build_index(&temp_dir, 100_000);

    // Box edge as a fraction of the populated area
    for divisor in [100i64, 10, 2] {
        let half = SPREAD / divisor;
        let bbox = BoundingBox::new(
            CENTER_LAT - half,
            CENTER_LON - half,
            CENTER_LAT + half,
            CENTER_LON + half,
        );
        group.bench_with_input(BenchmarkId::new("box_fraction", divisor), &bbox, |b, bbox| {
            b.iter(|| black_box(index.query(black_box(bbox)).unwrap().len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_range_query);

criterion_main!(benches);
