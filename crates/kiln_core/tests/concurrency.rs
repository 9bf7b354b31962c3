//! # Concurrency Tests
//!
//! Cross-thread behaviour of the shared components:
//!
//! 1. **Lock-free allocator**: concurrent claims never overlap
//! 2. **Spin locks**: single-owner allocators shared behind a `SpinLock`
//! 3. **SPSC queue**: FIFO delivery between two threads
//!
//! Run with: cargo test -p kiln_core --test concurrency -- --nocapture

use std::sync::{Arc, Barrier};
use std::thread;

use kiln_core::{
    Allocation, AllocatorConfig, ArenaAllocator, LockFreeLinearAllocator, PoolAllocator,
    SegregatedFreeListHeap, SpinLock, SpinSemaphore, SpscQueue,
};

const THREADS: usize = 8;

// ============================================================================
// LOCK-FREE LINEAR ALLOCATOR
// ============================================================================

#[test]
fn lock_free_claims_are_disjoint() {
    const PER_THREAD: usize = 2_000;

    let allocator = Arc::new(LockFreeLinearAllocator::new(THREADS * PER_THREAD * 64));
    let (tx, rx) = crossbeam_channel::unbounded::<Allocation>();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let size = 1 + (t * 7 + i) % 24;
                    let align = 1 << (i % 4);
                    let allocation = allocator
                        .allocate_aligned(size, align)
                        .expect("arena sized for every request");
                    tx.send(allocation).unwrap();
                }
            })
        })
        .collect();
    drop(tx);
    for handle in handles {
        handle.join().unwrap();
    }

    let mut claims: Vec<Allocation> = rx.iter().collect();
    assert_eq!(claims.len(), THREADS * PER_THREAD);
    claims.sort_by_key(|a| a.offset());
    for pair in claims.windows(2) {
        assert!(
            pair[0].end() <= pair[1].offset(),
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
    }
    assert!(claims.last().unwrap().end() <= allocator.used());
    println!("CAS retries: {}", allocator.contention());
}

#[test]
fn lock_free_slices_keep_their_contents() {
    const PER_THREAD: usize = 500;

    let allocator = Arc::new(LockFreeLinearAllocator::new(THREADS * PER_THREAD * 32));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let marker = u8::try_from(t + 1).unwrap();
                let mut slices = Vec::with_capacity(PER_THREAD);
                for _ in 0..PER_THREAD {
                    let bytes = allocator.allocate_bytes(24, 8).unwrap();
                    bytes.fill(marker);
                    slices.push(bytes);
                }
                // Everyone has written before anyone checks.
                barrier.wait();
                slices
                    .iter()
                    .all(|bytes| bytes.iter().all(|&b| b == marker))
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}

#[test]
fn lock_free_exhaustion_is_shared_correctly() {
    let allocator = Arc::new(LockFreeLinearAllocator::with_config(
        4096,
        &AllocatorConfig::default().with_guards(false),
    ));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let mut bytes = 0;
                while allocator.allocate_aligned(16, 16).is_some() {
                    bytes += 16;
                }
                bytes
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 4096);
    assert_eq!(allocator.remaining(), 0);
}

// ============================================================================
// SPIN-LOCKED ALLOCATORS
// ============================================================================

#[test]
fn spin_locked_pool_hands_out_exclusive_blocks() {
    const ROUNDS: usize = 2_000;

    let pool = Arc::new(SpinLock::new(PoolAllocator::with_config(
        64,
        THREADS,
        &AllocatorConfig::default().with_guards(true),
    )));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let marker = u8::try_from(t).unwrap();
                for _ in 0..ROUNDS {
                    let block = pool.lock().allocate().expect("one block per thread");
                    pool.lock().bytes_mut(block).fill(marker);
                    thread::yield_now();
                    assert!(pool.lock().bytes(block).iter().all(|&b| b == marker));
                    pool.lock().deallocate(block);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let pool = Arc::try_unwrap(pool).ok().unwrap().into_inner();
    assert_eq!(pool.free_count(), THREADS);
}

#[test]
fn spin_locked_heap_stays_consistent() {
    const ROUNDS: usize = 500;

    let heap = Arc::new(SpinLock::new(SegregatedFreeListHeap::with_config(
        64 * 1024,
        &AllocatorConfig::default().with_guards(true),
    )));
    let semaphore = Arc::new(SpinSemaphore::new(THREADS / 2));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let _permit = semaphore.acquire();
                    let size = 16 + (t * 31 + round * 17) % 400;
                    let Some(block) = heap.lock().allocate(size) else {
                        continue;
                    };
                    heap.lock().deallocate(block);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let heap = heap.lock();
    assert!(heap.validate().is_ok());
    let stats = heap.stats();
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
}

// ============================================================================
// SPSC QUEUE
// ============================================================================

#[test]
fn spsc_delivers_owned_values_in_order() {
    const ITEMS: usize = 50_000;

    let (mut producer, mut consumer) = SpscQueue::with_capacity(128);

    let writer = thread::spawn(move || {
        for i in 0..ITEMS {
            let mut item = format!("item-{i}");
            loop {
                match producer.enqueue(item) {
                    Ok(()) => break,
                    Err(back) => {
                        item = back;
                        thread::yield_now();
                    }
                }
            }
        }
    });

    let mut received = 0;
    while received < ITEMS {
        match consumer.dequeue() {
            Some(item) => {
                assert_eq!(item, format!("item-{received}"));
                received += 1;
            }
            None => std::hint::spin_loop(),
        }
    }
    writer.join().unwrap();
    assert!(consumer.is_empty());
}
