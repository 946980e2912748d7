//! Lock acquisition benchmarks.
//!
//! Uncontended fast paths for every primitive, plus a sorted multi-zone
//! acquisition.
//!
//! Run with: `cargo bench --package delve_sync`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use delve_sync::{HybridLock, ReaderWriterLock, SpinLock, WaitFreeCounter, ZoneLockManager};

fn bench_spin_lock(c: &mut Criterion) {
    let lock = SpinLock::new();
    c.bench_function("spin_lock_uncontended", |b| {
        b.iter(|| {
            let guard = lock.guard();
            black_box(guard.is_locked());
        });
    });
}

fn bench_hybrid_lock(c: &mut Criterion) {
    let lock = HybridLock::new();
    c.bench_function("hybrid_lock_uncontended", |b| {
        b.iter(|| {
            let guard = lock.guard();
            black_box(guard.is_locked());
        });
    });
}

fn bench_rwlock_read(c: &mut Criterion) {
    let lock = ReaderWriterLock::new();
    c.bench_function("rwlock_read_uncontended", |b| {
        b.iter(|| {
            let guard = lock.read(None);
            black_box(guard.is_locked());
        });
    });
}

fn bench_counter(c: &mut Criterion) {
    let counter = WaitFreeCounter::new(0);
    c.bench_function("wait_free_counter_increment", |b| {
        b.iter(|| black_box(counter.increment()));
    });
}

fn bench_multi_zone(c: &mut Criterion) {
    let zones = ZoneLockManager::new(64);
    let request = [42, 7, 63, 0, 19, 7];
    c.bench_function("multi_zone_lock_6", |b| {
        b.iter(|| {
            let guard = zones.multi_zone_guard(black_box(&request), None).unwrap();
            black_box(guard.zones().len());
        });
    });
}

criterion_group!(
    benches,
    bench_spin_lock,
    bench_hybrid_lock,
    bench_rwlock_read,
    bench_counter,
    bench_multi_zone
);
criterion_main!(benches);
