//! Transition engine benchmarks against the in-memory store.
//!
//! These measure engine overhead (validation, planning, commit retries and
//! metrics), not backing store latency.
//!
//! Run with: `cargo bench -p leasehold-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::TimeDelta;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use leasehold_core::environment::Clock;
use leasehold_core::partition::Partitioner;
use leasehold_core::types::{BatchId, HolderId, TicketId};
use leasehold_runtime::{EngineConfig, TransitionEngine};
use leasehold_testing::{InMemoryTicketStore, ManualClock, test_clock, tickets};
use std::sync::Arc;

fn engine(runtime: &tokio::runtime::Runtime, count: usize) -> (TransitionEngine<InMemoryTicketStore>, ManualClock) {
    let clock = ManualClock::new(test_clock().now());
    let engine = TransitionEngine::new(
        Arc::new(InMemoryTicketStore::new()),
        Arc::new(clock.clone()),
        EngineConfig::default(),
    );
    let batch = BatchId::new("90");
    runtime
        .block_on(engine.provision(&batch, &tickets(&batch, count)))
        .expect("Failed to provision");
    (engine, clock)
}

/// Partition key derivation (hash tag + CRC16 slot)
fn benchmark_partitioning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    group.throughput(Throughput::Elements(1));

    let partitioner = Partitioner::default();
    let batch = BatchId::new("event-2025-finals");

    group.bench_function("partition_key", |b| {
        b.iter(|| partitioner.partition_key(black_box(&batch)));
    });

    group.bench_function("slot", |b| {
        let key = partitioner.partition_key(&batch);
        b.iter(|| black_box(&key).slot());
    });

    group.finish();
}

/// Reserve followed by Rollback, so the pool stays the same size
fn benchmark_reserve_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_cycle");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        let (engine, _clock) = engine(&runtime, size);
        let batch = BatchId::new("90");
        let holder = HolderId::new("bench");
        let ids: Vec<TicketId> = (1..=size).map(|n| TicketId::new(n.to_string())).collect();

        group.bench_with_input(BenchmarkId::new("reserve_rollback", size), &ids, |b, ids| {
            b.to_async(&runtime).iter(|| async {
                let held = engine.reserve(&batch, ids, &holder, 30).await.expect("reserve failed");
                engine.rollback(&batch, &held.reserved_ids(), &holder).await.expect("rollback failed");
            });
        });

        group.bench_with_input(BenchmarkId::new("reserve_any_rollback", size), &size, |b, &size| {
            b.to_async(&runtime).iter(|| async {
                if let leasehold_core::ReserveAnyOutcome::Reserved(held) =
                    engine.reserve_any(&batch, size, &holder, 30).await.expect("reserve_any failed")
                {
                    let ids: Vec<_> = held.into_iter().map(|t| t.ticket_id).collect();
                    engine.rollback(&batch, &ids, &holder).await.expect("rollback failed");
                }
            });
        });
    }

    group.finish();
}

/// One sweep pass reclaiming 1000 lapsed leases
fn benchmark_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    group.throughput(Throughput::Elements(1000));
    group.sample_size(20);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let (engine, clock) = engine(&runtime, 1000);
    let batch = BatchId::new("90");
    let holder = HolderId::new("bench");
    let ids: Vec<TicketId> = (1..=1000).map(|n: usize| TicketId::new(n.to_string())).collect();
    let (sweeper, _shutdown) = engine.sweeper();

    group.bench_function("reclaim_1000", |b| {
        b.to_async(&runtime).iter(|| async {
            engine.reserve(&batch, &ids, &holder, 1).await.expect("reserve failed");
            clock.advance(TimeDelta::seconds(2));
            let report = sweeper.sweep_once(clock.now()).await.expect("sweep failed");
            black_box(report.reclaimed);
        });
    });

    group.finish();
}

/// Many holders racing for the same small pool
fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    group.throughput(Throughput::Elements(10));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    let (engine, _clock) = engine(&runtime, 10);

    group.bench_function("10_concurrent_reserve_rollback", |b| {
        b.to_async(&runtime).iter(|| async {
            let handles: Vec<_> = (0..10)
                .map(|n| {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let batch = BatchId::new("90");
                        let holder = HolderId::new(format!("bench-{n}"));
                        let ids = [TicketId::new(((n % 3) + 1).to_string())];
                        if let Ok(held) = engine.reserve(&batch, &ids, &holder, 30).await {
                            let _ = engine.rollback(&batch, &held.reserved_ids(), &holder).await;
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.await.expect("Task failed");
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_partitioning,
    benchmark_reserve_cycle,
    benchmark_sweep,
    benchmark_contention,
);
criterion_main!(benches);
