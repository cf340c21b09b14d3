use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mapstore_core::{IdIndex, IndexOptions, StoreOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tempfile::TempDir;

/// OSM-like IDs: dense and increasing, with gaps
fn node_ids(count: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(1);
    let mut id = 1_000_000u64;
    (0..count)
        .map(|_| {
            id += rng.random_range(1..20);
            id
        })
        .collect()
}

fn build_index(dir: &TempDir, ids: &[u64]) -> IdIndex {
    let options = IndexOptions::for_ids().with_batch(100_000, 4096);
    let mut index =
        IdIndex::open(dir.path().join("ids.idx"), StoreOptions::default(), options).unwrap();
    for (record, &id) in ids.iter().enumerate() {
        index.put(id, record as u32).unwrap();
    }
    index
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_put");
    group.sample_size(10);

    for count in [1_000usize, 10_000] {
        let ids = node_ids(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &ids, |b, ids| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                black_box(build_index(&temp_dir, ids).record_count());
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("id_get");
    group.sample_size(100);

    let ids = node_ids(50_000);
    let temp_dir = TempDir::new().unwrap();
    let index = build_index(&temp_dir, &ids);

    group.bench_function("cached", |b| {
        b.iter(|| black_box(index.get(black_box(ids[100])).unwrap()));
    });

    let mut rng = StdRng::seed_from_u64(2);
    group.bench_function("random", |b| {
        b.iter(|| {
            let id = ids[rng.random_range(0..ids.len())];
            black_box(index.get(id).unwrap())
        });
    });

    group.bench_function("missing", |b| {
        b.iter(|| black_box(index.get(black_box(u64::MAX >> 2)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get);

criterion_main!(benches);
