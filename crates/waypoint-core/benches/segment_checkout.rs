//! Segmented Hash Table Benchmark
//!
//! This benchmark measures:
//! - Uncontended checkout / checkin round trips
//! - Join build throughput with several writer threads
//! - Probe throughput against a reader snapshot

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use waypoint_core::chunk::{Chunk, Column, DataType, QueryIdSet, WaypointId};
use waypoint_core::hash::{SegmentGeometry, SegmentedHashTable, hash_key};
use waypoint_core::join::JoinRhs;

fn build_chunk(offset: i64, tuples: usize) -> Chunk {
    let keys: Vec<i64> = (offset..offset + tuples as i64).collect();
    let payload: Vec<i64> = keys.iter().map(|k| k * 7).collect();
    Chunk::uniform(
        vec![(0, Column::from(keys)), (1, Column::from(payload))],
        QueryIdSet::first_n(1),
    )
    .unwrap()
}

fn rhs() -> JoinRhs {
    JoinRhs::new(WaypointId(1), vec![(0, DataType::Int64)], vec![(1, DataType::Int64)])
}

fn benchmark_checkout_round_trip(c: &mut Criterion) {
    let table = SegmentedHashTable::new(SegmentGeometry::new(64, 8).unwrap());
    c.bench_function("checkout_checkin", |b| {
        b.iter(|| {
            let guard = table.checkout_one(u64::MAX).unwrap();
            black_box(guard.index());
            guard.checkin();
        })
    });
}

fn benchmark_parallel_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_build");
    let per_thread = 8 * 1024;
    for writers in [1usize, 2, 4, 8] {
        group.throughput(Throughput::Elements((writers * per_thread) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, &writers| {
            let chunks: Vec<Chunk> = (0..writers)
                .map(|w| build_chunk((w * per_thread) as i64, per_thread))
                .collect();
            b.iter(|| {
                let table = Arc::new(SegmentedHashTable::new(SegmentGeometry::new(64, 12).unwrap()));
                thread::scope(|s| {
                    for (w, chunk) in chunks.iter().enumerate() {
                        let table = Arc::clone(&table);
                        s.spawn(move || {
                            let mut rng = StdRng::seed_from_u64(w as u64);
                            rhs()
                                .insert_chunk(&table, chunk, QueryIdSet::first_n(1), 50, 0.9, &mut rng)
                                .unwrap()
                        });
                    }
                });
                black_box(table.stats().checkouts)
            })
        });
    }
    group.finish();
}

fn benchmark_probe(c: &mut Criterion) {
    let table = SegmentedHashTable::new(SegmentGeometry::new(16, 12).unwrap());
    let mut rng = StdRng::seed_from_u64(1);
    rhs()
        .insert_chunk(&table, &build_chunk(0, 32 * 1024), QueryIdSet::first_n(1), 50, 0.9, &mut rng)
        .unwrap();
    let view = table.enter_reader();
    let hashes: Vec<u64> = (0..4096i64).map(|k| hash_key(&[k.into()])).collect();

    let mut group = c.benchmark_group("probe");
    group.throughput(Throughput::Elements(hashes.len() as u64));
    group.bench_function("hits", |b| {
        b.iter(|| {
            let found: usize = hashes
                .iter()
                .map(|h| view.probe(*h).map_or(0, |p| p.count()))
                .sum();
            black_box(found)
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_checkout_round_trip,
    benchmark_parallel_build,
    benchmark_probe
);
criterion_main!(benches);
