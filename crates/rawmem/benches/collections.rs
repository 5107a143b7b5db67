//! Collection performance benchmarks.
//!
//! Measures:
//! - Appending to a `DynArray` through repeated growth
//! - Hash table inserts, hits and misses
//! - Lookups after heavy churn (tombstone-laden probe chains)
//! - The same lookups against `hashbrown` with FxHash and AHash

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rawmem::{DynArray, HashTable};

fn bench_array_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_add");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut array = DynArray::with_capacity(1);
                for i in 0..size {
                    array.add(black_box(i as u64));
                }
                array
            });
        });
    }

    group.finish();
}

fn bench_array_index_of(c: &mut Criterion) {
    let array: DynArray<u32> = (0..10_000).collect();

    c.bench_function("array_index_of_last", |b| {
        b.iter(|| black_box(array.index_of(black_box(&9_999))));
    });
}

fn bench_table_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_insert");

    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut table = HashTable::new();
                for key in 0..size as u64 {
                    table.add_or_set(black_box(key), key);
                }
                table
            });
        });
    }

    group.finish();
}

fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_lookup");
    let table: HashTable<u64, u64> = (0..10_000).map(|k| (k, k)).collect();

    group.bench_function("hit", |b| {
        b.iter(|| {
            for key in (0..10_000u64).step_by(7) {
                black_box(table.try_get_value(&key));
            }
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| {
            for key in (10_000..20_000u64).step_by(7) {
                black_box(table.try_get_value(&key));
            }
        });
    });

    group.finish();
}

fn bench_lookup_baselines(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_baseline");

    let fx: hashbrown::HashMap<u64, u64, fxhash::FxBuildHasher> =
        (0..10_000).map(|k| (k, k)).collect();
    group.bench_function("hashbrown_fxhash", |b| {
        b.iter(|| {
            for key in (0..10_000u64).step_by(7) {
                black_box(fx.get(&key));
            }
        });
    });

    let ahashed: hashbrown::HashMap<u64, u64, ahash::RandomState> =
        (0..10_000).map(|k| (k, k)).collect();
    group.bench_function("hashbrown_ahash", |b| {
        b.iter(|| {
            for key in (0..10_000u64).step_by(7) {
                black_box(ahashed.get(&key));
            }
        });
    });

    group.finish();
}

fn bench_table_churn(c: &mut Criterion) {
    let mut table = HashTable::<u64, u64>::with_capacity(4096);
    for key in 0..2_000 {
        table.add(key, key).unwrap();
    }
    for key in (0..2_000).step_by(2) {
        table.remove(&key).unwrap();
    }

    c.bench_function("table_lookup_after_churn", |b| {
        b.iter(|| {
            for key in 0..2_000u64 {
                black_box(table.contains_key(&key));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_array_add,
    bench_array_index_of,
    bench_table_insert,
    bench_table_lookup,
    bench_lookup_baselines,
    bench_table_churn
);
criterion_main!(benches);
