//! Criterion benchmarks for SessionStore
//!
//! Covers the calls the gateway hooks and the controller make on every
//! connect, disconnect and listing, plus mixed concurrent load.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;

use warden::session::{SessionStore, VpnSession};

// =============================================================================
// Test Fixtures
// =============================================================================

fn session(i: usize, users: usize) -> VpnSession {
    let mut s = VpnSession::new(format!("sess-{}", i), format!("user-{}", i % users));
    s.client_ip = format!("198.51.100.{}", i % 250);
    s.vpn_ip = format!("10.10.{}.{}", (i / 250) % 250, i % 250);
    s
}

/// Store without TTL holding `size` sessions spread over `size / 4` users
fn populated_store(size: usize) -> SessionStore {
    let store = SessionStore::new(None);
    let users = (size / 4).max(1);
    for i in 0..size {
        store.add(session(i, users)).ok();
    }
    store
}

// =============================================================================
// Benchmarks: Single Operations
// =============================================================================

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("overwrite", size), &size, |b, &size| {
            let store = populated_store(size);
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let i = rng.gen_range(0..size);
                black_box(store.add(session(i, size / 4 + 1)).ok());
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", size), &size, |b, &size| {
            let store = populated_store(size);
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let id = format!("sess-{}", rng.gen_range(0..size));
                black_box(store.get(&id).ok());
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| {
                black_box(store.get("absent").is_err());
            });
        });
    }

    group.finish();
}

fn bench_update_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_stats");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, &size| {
            let store = populated_store(size);
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let id = format!("sess-{}", rng.gen_range(0..size));
                black_box(store.update_stats(&id, 1024, 2048).ok());
            });
        });
    }

    group.finish();
}

// =============================================================================
// Benchmarks: Scans
// =============================================================================

fn bench_scans(c: &mut Criterion) {
    let mut group = c.benchmark_group("scans");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("list", size), &size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| black_box(store.list().len()));
        });
        group.bench_with_input(BenchmarkId::new("list_by_username", size), &size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| black_box(store.list_by_username("user-0").len()));
        });
        group.bench_with_input(BenchmarkId::new("stats", size), &size, |b, &size| {
            let store = populated_store(size);
            b.iter(|| black_box(store.stats()));
        });
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_expired");
    group.sample_size(20);

    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("all_expired", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    // No runtime here, so the store has no sweeper of its own
                    let store = SessionStore::new(Some(Duration::from_nanos(1)));
                    for i in 0..size {
                        store.add(session(i, 16)).ok();
                    }
                    thread::sleep(Duration::from_millis(1));
                    store
                },
                |store| black_box(store.sweep_expired()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

// =============================================================================
// Benchmarks: Concurrent Load
// =============================================================================

fn bench_concurrent_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_mixed");

    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(4 * 100)); // 4 threads x 100 ops

        group.bench_with_input(BenchmarkId::new("read_heavy", size), &size, |b, &size| {
            let store = Arc::new(populated_store(size));
            b.iter(|| {
                let handles: Vec<_> = (0..4)
                    .map(|t| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            let mut rng = rand::thread_rng();
                            for op in 0..100 {
                                let i = rng.gen_range(0..size);
                                if t == 0 && op % 10 == 0 {
                                    store.add(session(i, size / 4)).ok();
                                } else {
                                    black_box(store.get(&format!("sess-{}", i)).ok());
                                }
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().ok();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("connect_churn", size), &size, |b, &size| {
            let store = Arc::new(populated_store(size));
            b.iter(|| {
                let handles: Vec<_> = (0..4)
                    .map(|t| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            for op in 0..100 {
                                let i = size + t * 100 + op;
                                store.add(session(i, size / 4)).ok();
                                store.update_stats(&format!("sess-{}", i), 10, 20).ok();
                                store.remove(&format!("sess-{}", i)).ok();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().ok();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add,
    bench_get,
    bench_update_stats,
    bench_scans,
    bench_sweep,
    bench_concurrent_mixed,
);
criterion_main!(benches);
