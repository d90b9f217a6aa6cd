//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! These benchmarks measure the paths every write takes: record encoding,
//! key decoding, buffer write+sync, and the container fast path.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flash_journal::buffer::{DurableBufferPool, MemoryDevice, RawDevice};
use flash_journal::key::DecodedKey;
use flash_journal::record::{LogRecord, RecordIter};
use flash_journal::store::{BackingStore, InMemoryBackingStore};
use flash_journal::{ContainerRegistry, JournalConfig};
use std::sync::Arc;

/// Benchmark LogRecord encoding for various value sizes
fn bench_record_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_encode");
    group.throughput(Throughput::Elements(1));

    for value_len in [16, 256, 4096] {
        let record = LogRecord::write(7, 42, "42_orders_item", &vec![b'x'; value_len]);
        let mut out = Vec::with_capacity(record.encoded_len());
        group.bench_function(format!("value_len_{}", value_len), |b| {
            b.iter(|| {
                out.clear();
                black_box(&record).encode_into(&mut out);
                black_box(out.len())
            })
        });
    }

    group.finish();
}

/// Benchmark scanning an SO-sized region of records
fn bench_record_iterate(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_iterate");

    let mut region = Vec::new();
    for i in 0..256u64 {
        LogRecord::write(i, i, &format!("{}_pg{}_k", i, i % 8), &[b'v'; 100]).encode_into(&mut region);
    }
    group.throughput(Throughput::Elements(256));
    group.bench_function("256_records", |b| {
        b.iter(|| RecordIter::new(black_box(&region)).filter(|r| r.is_ok()).count())
    });

    group.finish();
}

/// Benchmark key decoding
fn bench_key_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_decode");
    group.throughput(Throughput::Elements(1));

    let keys = [
        "1_pg",
        "123456_orders_item",
        "18446744073709551615_placement_group_name_with_a_long_rest_segment",
    ];
    for key in keys {
        group.bench_function(format!("len_{}", key.len()), |b| {
            b.iter(|| DecodedKey::parse(black_box(key), 256).map(|k| k.counter()))
        });
    }

    group.finish();
}

/// Benchmark appending and syncing small records into a durable buffer
fn bench_pool_write_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_write_sync");
    group.throughput(Throughput::Elements(1));

    let config = JournalConfig::default().buffer;
    let device = MemoryDevice::new(config.partition_size());
    let pool = DurableBufferPool::new(config, vec![Arc::new(device) as Arc<dyn RawDevice>])
        .expect("pool");
    let id = pool.acquire().expect("buffer");
    let record = vec![b'r'; 128];

    group.bench_function("128_bytes", |b| {
        b.iter(|| {
            if pool.write_partial(id, black_box(&record), true).is_err() {
                pool.reset(id).expect("reset");
            }
        })
    });

    group.finish();
}

/// Benchmark Container::write through the registry (buffer sync included)
fn bench_container_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("container_write");
    group.throughput(Throughput::Elements(1));

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = JournalConfig::default();
    config.journal.crash_recovery_dir = dir.path().to_path_buf();
    let device = MemoryDevice::new(config.buffer.partition_size());
    let store: Arc<dyn BackingStore> = Arc::new(InMemoryBackingStore::new());
    let registry = ContainerRegistry::start(config, store, vec![Arc::new(device) as Arc<dyn RawDevice>])
        .expect("registry");
    let container = registry.open(0).expect("container");
    let value = vec![b'v'; 100];

    let mut counter = 0u64;
    group.bench_function("100_byte_value", |b| {
        b.iter(|| {
            counter += 1;
            container
                .write(&format!("{}_bench_k", counter), black_box(&value))
                .expect("write");
            // Keep rotated SOs reclaimable so the store stays small
            if counter % 64 == 0 {
                container.trim(&format!("{}_bench", counter)).expect("trim");
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_record_encode,
    bench_record_iterate,
    bench_key_decode,
    bench_pool_write_sync,
    bench_container_write,
);
criterion_main!(benches);
