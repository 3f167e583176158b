use criterion::{criterion_group, criterion_main, Criterion};
use normcache_engine::normalizer::NormalizeOptions;
use normcache_engine::{NormalizedStore, ReadOptions};
use normcache_storage::MemoryStorage;
use normcache_test_utils::{fixtures, schema};
use std::hint::black_box;

fn wide_ids() -> Vec<u8> {
    (0..200u16).map(|i| (i % u16::from(fixtures::POOL_SIZE)) as u8).collect()
}

fn bench_write(c: &mut Criterion) {
    let operation = schema::users_query();
    let data = fixtures::users_response(&wide_ids());
    let store = NormalizedStore::with_defaults(MemoryStorage::new()).expect("build store");

    c.bench_function("store/write_users", |b| {
        b.iter(|| {
            let changed = store
                .write_response(&operation, black_box(&data), &NormalizeOptions::default())
                .expect("write");
            black_box(changed.len());
        });
    });
}

fn bench_read(c: &mut Criterion) {
    let operation = schema::users_query();
    let data = fixtures::users_response(&wide_ids());
    let store = NormalizedStore::with_defaults(MemoryStorage::new()).expect("build store");
    store
        .write_response(&operation, &data, &NormalizeOptions::default())
        .expect("seed");

    c.bench_function("store/read_users", |b| {
        b.iter(|| {
            let result = store
                .read(black_box(&operation), &ReadOptions::default())
                .expect("read");
            black_box(result.is_stale);
        });
    });
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
