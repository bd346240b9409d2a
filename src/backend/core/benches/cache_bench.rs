//! Benchmarks for the cache tiers, the orchestrator and the typed facade.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use gatehouse_core::cache::{
    glob_match, Cache, CacheBackend, CacheTtl, MemoryCache, MemoryCacheConfig, MultiTierCache,
    MultiTierConfig,
};

fn memory(max_size: usize) -> Arc<dyn CacheBackend> {
    Arc::new(MemoryCache::new(
        MemoryCacheConfig::default()
            .with_max_size(max_size)
            .with_cleanup_interval(Duration::ZERO),
    ))
}

fn bench_memory_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_set");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for capacity in [100usize, 1_000, 10_000] {
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                let cache = memory(capacity);
                let mut i = 0u64;
                b.to_async(&rt).iter(|| {
                    i += 1;
                    let key = format!("key-{}", i % (capacity as u64 * 2));
                    let cache = cache.clone();
                    async move {
                        cache
                            .set(&key, b"bench-value".to_vec(), CacheTtl::Default)
                            .await
                            .unwrap()
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_memory_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_get");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = memory(10_000);
    rt.block_on(cache.set("hit", b"bench-value".to_vec(), CacheTtl::Never))
        .unwrap();

    group.bench_function("hit", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move { black_box(cache.get("hit").await.unwrap()) }
        });
    });

    group.bench_function("miss", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move { black_box(cache.get("absent").await.is_err()) }
        });
    });

    group.finish();
}

fn bench_memory_increment(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = memory(1_000);

    c.bench_function("memory_increment", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move { black_box(cache.increment("counter", 1).await.unwrap()) }
        });
    });
}

fn bench_multi_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_tier");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let l1 = memory(10_000);
    let l2 = memory(10_000);
    let cache = {
        let _guard = rt.enter();
        Arc::new(
            MultiTierCache::new(vec![l1.clone(), l2.clone()], MultiTierConfig::default()).unwrap(),
        )
    };
    rt.block_on(cache.set("hot", b"bench-value".to_vec(), CacheTtl::Never))
        .unwrap();

    group.bench_function("write_through_set", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move {
                cache
                    .set("k", b"bench-value".to_vec(), CacheTtl::Never)
                    .await
                    .unwrap()
            }
        });
    });

    group.bench_function("l1_hit", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            async move { black_box(cache.get("hot").await.unwrap()) }
        });
    });

    // Evict from L1 each round so every read falls through to L2.
    group.bench_function("l2_hit", |b| {
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            let l1 = l1.clone();
            async move {
                l1.delete("hot").await.unwrap();
                black_box(cache.get("hot").await.unwrap())
            }
        });
    });

    group.finish();
    rt.block_on(cache.close()).unwrap();
}

fn bench_typed_facade(c: &mut Criterion) {
    let mut group = c.benchmark_group("typed_facade");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for ops in [100usize, 1_000] {
        group.throughput(Throughput::Elements(ops as u64));
        group.bench_with_input(BenchmarkId::from_parameter(ops), &ops, |b, &ops| {
            let cache = Cache::new(memory(10_000), "bench");
            b.to_async(&rt).iter(|| {
                let cache = cache.clone();
                async move {
                    for i in 0..ops {
                        cache
                            .set(&format!("item-{i}"), &format!("value-{i}"), CacheTtl::Default)
                            .await
                            .unwrap();
                    }
                    for i in 0..ops {
                        let value: Option<String> =
                            cache.get(&format!("item-{i}")).await.unwrap();
                        black_box(value);
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_glob_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob_match");
    let key = "rbac:user:42:permissions";

    group.bench_function("prefix", |b| {
        b.iter(|| black_box(glob_match(black_box("rbac:user:*"), black_box(key))))
    });

    group.bench_function("infix", |b| {
        b.iter(|| black_box(glob_match(black_box("rbac:*:permissions"), black_box(key))))
    });

    group.bench_function("no_match", |b| {
        b.iter(|| black_box(glob_match(black_box("session:?"), black_box(key))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_memory_set,
    bench_memory_get,
    bench_memory_increment,
    bench_multi_tier,
    bench_typed_facade,
    bench_glob_match,
);
criterion_main!(benches);
