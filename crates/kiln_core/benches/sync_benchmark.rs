//! # Sync Benchmark
//!
//! Spin primitives against the crates we would otherwise reach for:
//! 1. `SpinLock` vs `parking_lot::Mutex` (uncontended and contended)
//! 2. `SpscQueue` vs `crossbeam_channel::bounded`
//! 3. `LockFreeLinearAllocator` under contention

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kiln_core::{LockFreeLinearAllocator, SpinLock, SpscQueue};
use parking_lot::Mutex;

const OPS: usize = 10_000;
const THREADS: usize = 4;

// =============================================================================
// LOCKS
// =============================================================================

fn bench_uncontended_locks(c: &mut Criterion) {
    let spin = SpinLock::new(0u64);
    c.bench_function("spinlock_uncontended_10k", |b| {
        b.iter(|| {
            for _ in 0..OPS {
                *spin.lock() += 1;
            }
            black_box(*spin.lock())
        });
    });

    let mutex = Mutex::new(0u64);
    c.bench_function("parking_lot_uncontended_10k", |b| {
        b.iter(|| {
            for _ in 0..OPS {
                *mutex.lock() += 1;
            }
            black_box(*mutex.lock())
        });
    });
}

/// Runs `op` `OPS` times on each of `THREADS` threads, released together.
fn contended<F>(op: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let op = Arc::clone(&op);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..OPS {
                    op();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn bench_contended_locks(c: &mut Criterion) {
    c.bench_function("spinlock_contended_4x10k", |b| {
        b.iter(|| {
            let lock = Arc::new(SpinLock::new(0u64));
            let shared = Arc::clone(&lock);
            contended(move || *shared.lock() += 1);
            black_box(*lock.lock())
        });
    });

    c.bench_function("parking_lot_contended_4x10k", |b| {
        b.iter(|| {
            let lock = Arc::new(Mutex::new(0u64));
            let shared = Arc::clone(&lock);
            contended(move || *shared.lock() += 1);
            black_box(*lock.lock())
        });
    });
}

// =============================================================================
// QUEUES
// =============================================================================

fn bench_queues(c: &mut Criterion) {
    c.bench_function("spsc_cross_thread_10k", |b| {
        b.iter(|| {
            let (mut tx, mut rx) = SpscQueue::with_capacity(256);
            let producer = thread::spawn(move || {
                for i in 0..OPS as u64 {
                    while tx.enqueue(i).is_err() {
                        std::hint::spin_loop();
                    }
                }
            });
            let mut sum = 0u64;
            let mut received = 0;
            while received < OPS {
                if let Some(v) = rx.dequeue() {
                    sum += v;
                    received += 1;
                }
            }
            producer.join().unwrap();
            black_box(sum)
        });
    });

    c.bench_function("crossbeam_bounded_cross_thread_10k", |b| {
        b.iter(|| {
            let (tx, rx) = crossbeam_channel::bounded(256);
            let producer = thread::spawn(move || {
                for i in 0..OPS as u64 {
                    tx.send(i).unwrap();
                }
            });
            let sum: u64 = rx.iter().take(OPS).sum();
            producer.join().unwrap();
            black_box(sum)
        });
    });
}

// =============================================================================
// LOCK-FREE BUMP
// =============================================================================

fn bench_lock_free_linear(c: &mut Criterion) {
    c.bench_function("lockfree_linear_contended_4x10k", |b| {
        b.iter(|| {
            let allocator = Arc::new(LockFreeLinearAllocator::new(THREADS * OPS * 32));
            let shared = Arc::clone(&allocator);
            contended(move || {
                black_box(shared.allocate(32));
            });
            black_box(allocator.contention())
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_locks,
    bench_contended_locks,
    bench_queues,
    bench_lock_free_linear
);
criterion_main!(benches);
