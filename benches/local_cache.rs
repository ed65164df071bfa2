//! Benchmark for the L1 hot path
//!
//! Target: sub-microsecond L1 hits

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use portal_cache::cache::local::LocalCache;
use portal_cache::{CacheConfig, CacheOptions, CacheService};
use std::sync::Arc;
use std::time::Duration;

fn bench_local_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cache");
    group.throughput(Throughput::Elements(1));

    let cache = LocalCache::new(Duration::from_secs(30));
    let payload = Arc::new(vec![0u8; 512]);
    for i in 0..10_000 {
        cache.insert(&format!("widget:{:05}", i), payload.clone(), None);
    }

    group.bench_function("get_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("widget:{:05}", counter % 10_000);
            black_box(cache.get(black_box(&key)));
        });
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| {
            black_box(cache.get(black_box("absent:1")));
        });
    });

    group.finish();
}

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert", |b| {
        let cache = LocalCache::new(Duration::from_secs(30));
        let payload = Arc::new(vec![0u8; 512]);
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let key = format!("widget:{}", counter % 50_000);
            cache.insert(black_box(&key), payload.clone(), Some(Duration::from_secs(300)));
        });
    });

    group.finish();
}

fn bench_purge_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_cache");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("purge_glob_1000_of_10000", |b| {
        let cache = LocalCache::new(Duration::from_secs(30));
        let payload = Arc::new(vec![0u8; 64]);

        b.iter(|| {
            for i in 0..10_000 {
                let prefix = if i % 10 == 0 { "dashboard" } else { "widget" };
                cache.insert(&format!("{}:{}", prefix, i), payload.clone(), None);
            }
            black_box(cache.purge_matching(black_box("dashboard:*")));
        });
    });

    group.finish();
}

fn bench_service_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_service");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = CacheService::in_memory(CacheConfig::default());
    rt.block_on(async {
        for i in 0..1_000u32 {
            cache
                .set(&format!("user:{}", i), &i, CacheOptions::new())
                .await
                .unwrap();
        }
    });

    group.bench_function("get_l1_hit_decoded", |b| {
        let mut counter = 0u32;
        b.iter(|| {
            counter += 1;
            let key = format!("user:{}", counter % 1_000);
            rt.block_on(async {
                black_box(cache.get::<u32>(black_box(&key)).await);
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_local_get,
    bench_local_insert,
    bench_purge_matching,
    bench_service_get,
);
criterion_main!(benches);
