//! Performance benchmarks for repo-kit
//!
//! This benchmark suite measures:
//! - EntityCache operations (set, get hit/miss) across payload sizes
//! - Repository point reads (cache hit vs. store read), creates and updates
//! - Snapshot envelope encoding and decoding
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use repo_kit::cache::EntityCache;
use repo_kit::config::CacheConfig;
use repo_kit::document::{Document, Value};
use repo_kit::serialization::{decode_snapshot, encode_snapshot};
use repo_kit::store::{MemoryStore, Snapshot};
use repo_kit::{
    CacheStrategy, CreateOptions, Entity, ReadOptions, Repository, RepositoryConfig,
    UpdateOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::hint::black_box;

// ============================================================================
// Benchmark Test Fixtures
// ============================================================================

/// Benchmark entity with configurable payload size
#[derive(Clone, Serialize, Deserialize)]
struct BenchEntity {
    name: String,
    counter: i64,
    payload: String,
}

impl Entity for BenchEntity {
    fn collection() -> &'static str {
        "bench"
    }
}

impl BenchEntity {
    fn new(size: usize) -> Self {
        BenchEntity {
            name: "bench".to_string(),
            counter: 0,
            payload: "x".repeat(size),
        }
    }
}

fn snapshot(size: usize) -> Snapshot {
    let mut data = Document::new();
    data.insert("name".to_string(), Value::from("bench"));
    data.insert("payload".to_string(), Value::from("x".repeat(size)));
    data.insert("version".to_string(), Value::Integer(1));
    Snapshot {
        id: "e1".to_string(),
        data,
        revision: 1,
        update_time: chrono::Utc::now(),
    }
}

// ============================================================================
// Group 1: EntityCache Benchmarks
// ============================================================================

fn cache_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_cache");

    for size in [100, 1_000, 10_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("set", size), size, |b, &size| {
                let cache = EntityCache::new(CacheConfig::default());
                let snap = snapshot(size);
                b.iter(|| cache.set(black_box("bench:e1"), black_box(&snap)));
            });

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                let cache = EntityCache::new(CacheConfig::default());
                cache.set("bench:e1", &snapshot(size));
                b.iter(|| cache.get(black_box("bench:e1")));
            });
    }

    group.bench_function("get_miss", |b| {
        let cache = EntityCache::new(CacheConfig::default());
        b.iter(|| cache.get(black_box("bench:missing")));
    });

    group.bench_function("set_with_eviction", |b| {
        let cache = EntityCache::new(CacheConfig::default().with_max_items(100));
        let snap = snapshot(100);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            cache.set(&format!("bench:{}", n), black_box(&snap));
        });
    });

    group.finish();
}

// ============================================================================
// Group 2: Repository Benchmarks
// ============================================================================

fn repository_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    let repo: Repository<BenchEntity, MemoryStore> = rt.block_on(async {
        let repo = Repository::new(MemoryStore::new(), RepositoryConfig::new("bench"))
            .expect("Failed to build repository");
        repo.create(BenchEntity::new(1_000), CreateOptions::default().with_id("e1"))
            .await
            .expect("Failed to seed");
        repo
    });

    group.bench_function("find_by_id_cached", |b| {
        b.to_async(&rt).iter(|| async {
            repo.find_by_id(black_box("e1"), ReadOptions::default())
                .await
                .expect("Failed to read")
        });
    });

    group.bench_function("find_by_id_bypass", |b| {
        let opts = ReadOptions::default().with_strategy(CacheStrategy::Bypass);
        b.to_async(&rt).iter(|| async {
            repo.find_by_id(black_box("e1"), opts.clone())
                .await
                .expect("Failed to read")
        });
    });

    group.bench_function("create", |b| {
        b.to_async(&rt).iter(|| async {
            repo.create(BenchEntity::new(100), CreateOptions::default())
                .await
                .expect("Failed to create")
        });
    });

    group.bench_function("update", |b| {
        b.to_async(&rt).iter(|| async {
            repo.update("e1", &json!({"counter": 1}), UpdateOptions::default())
                .await
                .expect("Failed to update")
        });
    });

    group.finish();
}

// ============================================================================
// Group 3: Serialization Benchmarks
// ============================================================================

fn serialization_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_envelope");

    for size in [100, 10_000].iter() {
        let snap = snapshot(*size);
        let encoded = encode_snapshot(&snap).expect("Failed to encode");

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("encode", size), &snap, |b, snap| {
                b.iter(|| encode_snapshot(black_box(snap)));
            });

        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, bytes| {
                b.iter(|| decode_snapshot(black_box(bytes)));
            });
    }

    group.finish();
}

// ============================================================================
// Benchmark Registration
// ============================================================================

criterion_group!(
    benches,
    cache_benchmarks,
    repository_benchmarks,
    serialization_benchmarks
);
criterion_main!(benches);
