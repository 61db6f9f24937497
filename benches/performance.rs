//! Performance benchmarks for the engagement ledger.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use engagement_ledger::{
    AccountId, AccountRegistry, AccountStore, IndexKey, NormalizedRecord, PostBody, RecordBody,
    StoreConfig, SubjectBody, Timestamp, Unresolved,
};
use tempfile::TempDir;

fn create_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        sync_interval: 1000,
        ..StoreConfig::at(dir.path())
    }
}

fn alice() -> AccountId {
    AccountId::new("did:plc:alice")
}

fn post(i: u64) -> NormalizedRecord {
    NormalizedRecord::new(
        alice(),
        IndexKey::new("app.bsky.feed.post", format!("r{}", i)),
        Timestamp(i as i64),
        RecordBody::Post(PostBody {
            text: format!("post number {}", i),
            created_at: "2024-05-01T12:00:00Z".to_string(),
            langs: vec!["en".to_string()],
            ..Default::default()
        }),
    )
}

fn like(actor: &AccountId, i: u64) -> NormalizedRecord {
    NormalizedRecord::new(
        actor.clone(),
        IndexKey::new("app.bsky.feed.like", format!("l{}", i)),
        Timestamp(i as i64),
        RecordBody::Like(SubjectBody {
            subject: format!("at://{}/app.bsky.feed.post/r{}", alice(), i % 100),
            created_at: String::new(),
        }),
    )
}

/// Benchmark batch ingest with varying batch sizes
fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for batch in [1u64, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            let dir = TempDir::new().unwrap();
            let store = AccountStore::open(alice(), create_config(&dir)).unwrap();
            let mut next = 0u64;

            b.iter(|| {
                let records = (next..next + batch).map(post).collect();
                next += batch;
                black_box(store.ingest(records, &Unresolved).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark cross-store like dispersion
fn bench_dispersion(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = AccountRegistry::new(create_config(&dir)).unwrap();
    registry.ingest(&alice(), (0..100).map(post).collect()).unwrap();
    let carol = AccountId::new("did:plc:carol");
    let mut next = 0u64;

    c.bench_function("like_dispersion", |b| {
        b.iter(|| {
            next += 1;
            black_box(registry.ingest(&carol, vec![like(&carol, next)]).unwrap());
        });
    });
}

/// Benchmark counters reads with a populated store
fn bench_read_counters(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = AccountRegistry::new(create_config(&dir)).unwrap();
    registry.ingest(&alice(), (0..100).map(post).collect()).unwrap();
    let carol = AccountId::new("did:plc:carol");
    registry
        .ingest(&carol, (0..1000).map(|i| like(&carol, i)).collect())
        .unwrap();

    let keys: Vec<_> = (0..100)
        .map(|i| IndexKey::new("app.bsky.feed.post", format!("r{}", i)))
        .collect();
    let mut i = 0;

    c.bench_function("read_counters", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(registry.read_counters(&alice(), &keys[i]).unwrap());
        });
    });
}

/// Benchmark cached and uncached record reads
fn bench_read_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_record");

    for cache in [1usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("cache", cache), &cache, |b, &cache| {
            let dir = TempDir::new().unwrap();
            let store = AccountStore::open(
                alice(),
                StoreConfig {
                    envelope_cache_size: cache,
                    ..create_config(&dir)
                },
            )
            .unwrap();
            store.ingest((0..5000).map(post).collect(), &Unresolved).unwrap();
            let mut i = 0u64;

            b.iter(|| {
                i = (i + 7) % 5000;
                let key = IndexKey::new("app.bsky.feed.post", format!("r{}", i));
                black_box(store.read_record(&key).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark compaction of a log with superseded versions
fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    group.sample_size(10);

    for versions in [2u64, 10] {
        group.bench_with_input(BenchmarkId::new("versions_per_key", versions), &versions, |b, &versions| {
            b.iter_with_setup(
                || {
                    let dir = TempDir::new().unwrap();
                    let store = AccountStore::open(alice(), create_config(&dir)).unwrap();
                    for v in 0..versions {
                        let records = (0..500)
                            .map(|i| {
                                let mut record = post(i);
                                record.source_timestamp = Timestamp((v * 1000 + i) as i64);
                                record.body = RecordBody::Post(PostBody {
                                    text: format!("version {} of {}", v, i),
                                    ..Default::default()
                                });
                                record
                            })
                            .collect();
                        store.ingest(records, &Unresolved).unwrap();
                    }
                    (dir, store)
                },
                |(_dir, store)| {
                    black_box(store.compact(None).unwrap());
                },
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ingest,
    bench_dispersion,
    bench_read_counters,
    bench_read_record,
    bench_compaction,
);

criterion_main!(benches);
