//! Benchmarks for tiered cache lookups
//!
//! This benchmark measures:
//! - Memory-tier hits
//! - Disk-tier hits that promote into memory
//! - Misses against a populated cache
//! - Puts that persist to disk

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use dealscope::cache::{CacheConfig, TieredCache};
use serde_json::{json, Value};
use std::time::Duration;

fn sample_payload(i: usize) -> Value {
    json!({
        "title": format!("Game {i}"),
        "score": 7.5,
        "price": {"current": 9.99, "regular": 29.99, "currency": "USD"},
        "verdict": "Worth it at this discount; strong reviews and long playtime.",
        "tags": ["roguelike", "indie", "co-op"],
    })
}

fn bench_memory_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_hit");
    for size in [64usize, 1024] {
        let cache = TieredCache::in_memory(size).unwrap();
        for i in 0..size {
            cache.put(&format!("game {i}"), sample_payload(i), Duration::ZERO, false);
        }
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % size;
                black_box(cache.get(&format!("game {i}")))
            });
        });
    }
    group.finish();
}

fn bench_disk_promotion(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::open(
        CacheConfig::new()
            .with_cache_dir(dir.path())
            .with_memory_capacity(1)
            .with_disk_capacity(1024),
    )
    .unwrap();
    for i in 0..256 {
        cache.put(&format!("game {i}"), sample_payload(i), Duration::ZERO, true);
    }

    c.bench_function("disk_hit_with_promotion", |b| {
        let mut i = 0;
        b.iter(|| {
            // Memory holds one entry, so each alternate key comes from disk.
            i = (i + 1) % 256;
            black_box(cache.get(&format!("game {i}")))
        });
    });
}

fn bench_miss(c: &mut Criterion) {
    let cache: TieredCache<Value> = TieredCache::in_memory(1024).unwrap();
    for i in 0..1024 {
        cache.put(&format!("game {i}"), sample_payload(i), Duration::ZERO, false);
    }
    c.bench_function("miss", |b| {
        b.iter(|| black_box(cache.get(black_box("not a cached game"))));
    });
}

fn bench_persisting_put(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let cache = TieredCache::open(
        CacheConfig::new()
            .with_cache_dir(dir.path())
            .with_disk_capacity(128),
    )
    .unwrap();
    let payload = sample_payload(0);
    c.bench_function("put_persist", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            black_box(cache.put(&format!("game {}", i % 512), payload.clone(), Duration::ZERO, true))
        });
    });
}

criterion_group!(
    benches,
    bench_memory_hits,
    bench_disk_promotion,
    bench_miss,
    bench_persisting_put
);
criterion_main!(benches);
