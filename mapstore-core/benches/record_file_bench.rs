use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use mapstore_core::{RecordFile, StoreOptions};
use std::hint::black_box;
use tempfile::TempDir;

const RECORD: usize = 28;
const RECORDS: u32 = 100_000;

fn modes() -> [(&'static str, StoreOptions); 2] {
    [("mapped", StoreOptions::default()), ("unmapped", StoreOptions::unmapped())]
}

fn filled_file(dir: &TempDir, options: StoreOptions) -> RecordFile {
    let path = dir.path().join("bench.idx");
    let mut file = RecordFile::open(&path, RECORD, options).unwrap();
    file.grow_file(RECORDS, RECORDS).unwrap();
    for r in 0..RECORDS {
        file.write_record(r, &[(r % 251) as u8; RECORD]).unwrap();
    }
    file
}

fn bench_hot_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("hot_read");
    group.sample_size(1000);

    for (name, options) in modes() {
        let temp_dir = TempDir::new().unwrap();
        let file = filled_file(&temp_dir, options);

        group.bench_function(name, |b| {
            b.iter(|| {
                let record = file.read_record(black_box(5000)).unwrap();
                black_box(record.len());
            });
        });
    }

    group.finish();
}

fn bench_scattered_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("scattered_read");
    group.sample_size(50);

    for (name, options) in modes() {
        let temp_dir = TempDir::new().unwrap();
        let file = filled_file(&temp_dir, options);

        group.bench_function(name, |b| {
            b.iter(|| {
                // Stride past the cache so most reads miss
                let mut r = 0u32;
                for _ in 0..10_000 {
                    r = (r + 7919) % RECORDS;
                    black_box(file.read_record(r).unwrap().len());
                }
            });
        });
    }

    group.finish();
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.sample_size(100);

    for (name, options) in modes() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = filled_file(&temp_dir, options);
        let bytes = [0xABu8; RECORD];

        group.bench_function(name, |b| {
            let mut r = 0u32;
            b.iter(|| {
                r = (r + 1) % RECORDS;
                file.write_record(black_box(r), &bytes).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("growth");
    group.sample_size(20);

    for batch in [1_000u32, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let path = temp_dir.path().join("grow.idx");
                let mut file = RecordFile::open(path, RECORD, StoreOptions::default()).unwrap();
                for _ in 0..10 {
                    file.grow_file(batch, batch).unwrap();
                }
                black_box(file.record_count());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hot_read, bench_scattered_read, bench_write, bench_growth);

criterion_main!(benches);
