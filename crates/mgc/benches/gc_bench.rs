//! MGC Benchmarks
//!
//! Allocation throughput and full-cycle pause times over live heaps of
//! different shapes and worker counts.
//! Run with: `cargo bench --package mgc`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mgc::{GcConfig, Mutator, Runtime, MB};
use std::time::{Duration, Instant};

fn create_runtime(workers: usize) -> Runtime {
    let config = GcConfig {
        arena_size: 256 * MB,
        gc_threads: Some(workers),
        finalizers: false,
        ..Default::default()
    };
    Runtime::new(config).unwrap()
}

/// Singly linked list of `len` nodes rooted at its head
fn build_list(m: &mut Mutator, len: usize) {
    let head = m.alloc(32).unwrap();
    m.push_root(head);
    let mut prev = head;
    for _ in 1..len {
        let next = m.alloc(32).unwrap();
        m.write_slot(prev, 0, next).unwrap();
        prev = next;
    }
}

/// Complete binary tree of `depth` levels rooted at its top node
fn build_tree(m: &mut Mutator, depth: u32) {
    let root = m.alloc(16).unwrap();
    m.push_root(root);
    let mut level = vec![root];
    for _ in 1..depth {
        let mut next = Vec::with_capacity(level.len() * 2);
        for &parent in &level {
            for slot in 0..2 {
                let child = m.alloc(16).unwrap();
                m.write_slot(parent, slot, child).unwrap();
                next.push(child);
            }
        }
        level = next;
    }
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    let runtime = create_runtime(2);
    let mut m = runtime.attach();
    for &size in &[16usize, 64, 256, 1024, 8192] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("size_{}", size), |b| {
            b.iter(|| black_box(m.alloc(size).unwrap()))
        });
    }
    group.bench_function("noscan_64", |b| {
        b.iter(|| black_box(m.alloc_noscan(64).unwrap()))
    });
    group.bench_function("large_64k", |b| {
        b.iter(|| black_box(m.alloc(64 * 1024).unwrap()))
    });

    group.finish();
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_cycle");
    group.sample_size(20);

    for &workers in &[1usize, 2, 4] {
        let runtime = create_runtime(workers);
        let mut m = runtime.attach();
        build_tree(&mut m, 16);
        group.bench_with_input(
            BenchmarkId::new("tree_64k_nodes", workers),
            &workers,
            |b, _| b.iter(|| black_box(m.collect(true).unwrap())),
        );
    }

    for &workers in &[1usize, 4] {
        let runtime = create_runtime(workers);
        let mut m = runtime.attach();
        build_list(&mut m, 100_000);
        group.bench_with_input(
            BenchmarkId::new("list_100k_nodes", workers),
            &workers,
            |b, _| b.iter(|| black_box(m.collect(true).unwrap())),
        );
    }

    group.finish();
}

fn bench_reclaim(c: &mut Criterion) {
    let mut group = c.benchmark_group("reclaim");
    group.sample_size(20);

    let runtime = create_runtime(2);
    let mut m = runtime.attach();
    group.bench_function("garbage_10k_objects", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                for _ in 0..10_000 {
                    m.alloc(48).unwrap();
                }
                let start = Instant::now();
                black_box(m.collect(true).unwrap());
                total += start.elapsed();
            }
            total
        })
    });

    group.finish();
}

criterion_group!(benches, bench_allocation, bench_full_cycle, bench_reclaim);
criterion_main!(benches);
