//! Benchmarks for the two-tier tile cache
//!
//! Measures memory hits, puts that demote, and disk promotions.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use raster_tile_cache::{CacheConfig, CacheRegistry, TileCache, TileKey, TileMetadata, TilePayload};
use tempfile::TempDir;

const TILE_SIDE: u32 = 256;

fn tile(fill: u8) -> TilePayload {
    let len = (TILE_SIDE * TILE_SIDE * 3) as usize;
    TilePayload::new(vec![fill; len], TileMetadata::new(TILE_SIDE, TILE_SIDE, 3), 1).unwrap()
}

fn key(i: u64) -> TileKey {
    TileKey::for_tile("bench", 12, (i % 64) as u32, (i / 64) as u32).unwrap()
}

fn bench_memory_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_cache");
    group.throughput(Throughput::Elements(1));

    let root = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let cache = registry
        .get_instance(&CacheConfig::new(root.path()).with_memory_budget("256m"))
        .unwrap();
    for i in 0..512 {
        cache.put(key(i), tile(i as u8)).unwrap();
    }

    group.bench_function("memory_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let lookup = cache.get(black_box(&key(counter % 512))).unwrap();
            black_box(lookup);
        });
    });

    group.finish();
}

fn bench_put_with_demotion(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_cache");
    group.throughput(Throughput::Bytes((TILE_SIDE * TILE_SIDE * 3) as u64));

    let root = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    // Room for 16 tiles in memory; every further put demotes one
    let cache = registry
        .get_instance(
            &CacheConfig::new(root.path())
                .with_memory_budget("3m")
                .with_disk_budget("64m"),
        )
        .unwrap();
    let payload = tile(7);

    group.bench_function("put_demoting", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            cache.put(key(counter % 4096), black_box(payload.clone())).unwrap();
        });
    });

    group.finish();
}

fn bench_disk_promotion(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_cache");
    group.throughput(Throughput::Elements(1));

    let root = TempDir::new().unwrap();
    let registry = CacheRegistry::new();
    let cache = registry
        .get_instance(
            &CacheConfig::new(root.path())
                .with_memory_budget("1m")
                .with_disk_budget("256m"),
        )
        .unwrap();
    for i in 0..256 {
        cache.put(key(i), tile(i as u8)).unwrap();
    }
    cache.flush().unwrap();

    // Each hit promotes one tile and demotes another, so lookups cycle
    // through disk
    group.bench_function("disk_promotion", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let lookup = cache.get(black_box(&key(counter % 256))).unwrap();
            black_box(lookup);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_hits,
    bench_put_with_demotion,
    bench_disk_promotion,
);
criterion_main!(benches);
