use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spillcache::bitset::{BitSetTree, ConcurrentBitSet};
use spillcache::index::BlockClosedLongIntHashTable;
use spillcache::storage::{MemoryStorageManager, StorageManager, StoreBlockManager};
use std::hint::black_box;
use std::sync::Arc;

const BITS: usize = 1 << 20;

fn bench_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_bitset");
    for segments in [1usize, 16] {
        group.throughput(Throughput::Elements(1024));
        group.bench_with_input(
            BenchmarkId::new("allocate_release_1024", segments),
            &segments,
            |b, &segments| {
                let bits = ConcurrentBitSet::new(BITS, segments);
                let mut held = Vec::with_capacity(1024);
                b.iter(|| {
                    for _ in 0..1024 {
                        held.extend(bits.get_and_set_next_clear_bit());
                    }
                    for bit in held.drain(..) {
                        bits.clear(bit);
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_tree_scan(c: &mut Criterion) {
    let mut tree = BitSetTree::new(BITS);
    // Every 4096th bit set: scans must skip long empty runs.
    for i in (0..BITS).step_by(4096) {
        tree.set(i, true);
    }
    c.bench_function("bitset_tree/next_set_bit_sparse", |b| {
        b.iter(|| {
            let mut count = 0;
            let mut from = 0;
            while let Some(i) = tree.next_set_bit(from) {
                count += 1;
                from = i + 1;
            }
            black_box(count)
        })
    });
}

fn bench_hash_table(c: &mut Criterion) {
    let storage = MemoryStorageManager::new();
    let store = storage.create_file_store("bench").unwrap();
    let manager = Arc::new(StoreBlockManager::new(store, 8192, 1 << 16));
    let table = BlockClosedLongIntHashTable::new(manager, 16);
    for key in 0..100_000i64 {
        table.put(key, key as i32).unwrap();
    }

    let mut group = c.benchmark_group("block_hash_table");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("get_1000", |b| {
        b.iter(|| {
            for key in (0..100_000i64).step_by(100) {
                black_box(table.get(key).unwrap());
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_allocate_release, bench_tree_scan, bench_hash_table);
criterion_main!(benches);
