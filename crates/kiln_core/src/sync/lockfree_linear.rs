//! # Lock-Free Linear Allocator
//!
//! A bump allocator any number of threads can allocate from at once.
//!
//! ## Architecture
//!
//! ```text
//!   Thread A ─┐
//!   Thread B ─┼─► CAS(cursor: old → aligned(old) + size) ─► disjoint ranges
//!   Thread C ─┘
//! ```
//!
//! A failed CAS means another thread claimed a range first; the loser
//! reloads the cursor and retries. Some thread always makes progress, so
//! the allocator is lock-free but not wait-free.

#![allow(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use bytemuck::Pod;
use crossbeam_utils::CachePadded;

use crate::config::AllocatorConfig;
use crate::error::MemoryResult;
use crate::memory::alignment::{padding_for, DEFAULT_ALIGNMENT};
use crate::memory::guard::Guard;
use crate::memory::{Allocation, Arena};

/// Failed CAS attempts per cycle above which `release` logs a warning.
const HIGH_CONTENTION: usize = 1024;

/// A thread-safe bump allocator.
///
/// Allocation takes `&self`; [`release`](Self::release) takes `&mut self`,
/// so every allocating thread has finished (and every handed-out slice is
/// dead) before the cursor can move back.
pub struct LockFreeLinearAllocator {
    arena: Arena,
    /// Offset of the first unclaimed byte.
    cursor: CachePadded<AtomicUsize>,
    /// Failed CAS attempts since the last release.
    contention: AtomicUsize,
    guard: Guard,
}

impl LockFreeLinearAllocator {
    /// Creates an allocator over a `capacity`-byte arena with the default
    /// configuration.
    ///
    /// # Panics
    ///
    /// Panics if capacity is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, &AllocatorConfig::default())
    }

    /// Creates an allocator with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the capacity or configuration is invalid.
    #[must_use]
    pub fn with_config(capacity: usize, config: &AllocatorConfig) -> Self {
        Self::try_with_config(capacity, config)
            .unwrap_or_else(|e| panic!("lock-free linear allocator: {e}"))
    }

    /// Creates an allocator, reporting invalid parameters as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is zero or the configuration is
    /// invalid.
    pub fn try_with_config(capacity: usize, config: &AllocatorConfig) -> MemoryResult<Self> {
        config.validate()?;
        let guard = Guard::new("lock-free linear", config);
        let arena = Arena::reserve(capacity, config.alignment, guard.initial_fill(), &config.backing)?;
        Ok(Self {
            arena,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            contention: AtomicUsize::new(0),
            guard,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Bytes claimed so far, including padding.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Bytes left before the arena is exhausted.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Failed CAS attempts since the last release.
    #[inline]
    #[must_use]
    pub fn contention(&self) -> usize {
        self.contention.load(Ordering::Relaxed)
    }

    /// Claims `size` bytes aligned to [`DEFAULT_ALIGNMENT`].
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<Allocation> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Claims `size` bytes whose address is a multiple of `align`.
    ///
    /// Returns `None` when the arena cannot fit the request, or if `align`
    /// is not a power of two (a fault with guards enabled).
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<Allocation> {
        if !self.guard.check_alignment(align) {
            return None;
        }
        let base = self.arena.base_addr();
        let capacity = self.capacity();

        // Only the RMW's atomicity matters for disjointness; the bytes are
        // published by whatever hands the allocation to another thread.
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = current.checked_add(padding_for(base.wrapping_add(current), align))?;
            let end = start.checked_add(size)?;
            if end > capacity {
                tracing::trace!(size, align, used = current, "lock-free allocator exhausted");
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Allocation::new(start, size)),
                Err(actual) => {
                    self.contention.fetch_add(1, Ordering::Relaxed);
                    current = actual;
                }
            }
        }
    }

    /// Claims a range and returns it as a mutable slice.
    #[allow(clippy::mut_from_ref)]
    pub fn allocate_bytes(&self, size: usize, align: usize) -> Option<&mut [u8]> {
        let allocation = self.allocate_aligned(size, align)?;
        // SAFETY: the CAS gave this range to us alone, nothing else hands
        // out views through `&self`, and `release` needs `&mut self`, so the
        // range stays disjoint from every other live slice.
        Some(unsafe { self.arena.slice_mut_unchecked(allocation.range()) })
    }

    /// Claims a zeroed slice of `count` elements.
    ///
    /// Returns `None` if out of space or if `T` is zero-sized.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice<T: Pod>(&self, count: usize) -> Option<&mut [T]> {
        let size = std::mem::size_of::<T>().checked_mul(count)?;
        let bytes = self.allocate_bytes(size, std::mem::align_of::<T>())?;
        bytes.fill(0);
        bytemuck::try_cast_slice_mut(bytes).ok()
    }

    /// Payload bytes of an allocation made by this allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocation lies outside the arena.
    pub fn bytes_mut(&mut self, allocation: Allocation) -> &mut [u8] {
        &mut self.arena.as_mut_slice()[allocation.range()]
    }

    /// Resets the cursor, invalidating every allocation.
    ///
    /// The exclusive borrow guarantees no thread is still allocating.
    pub fn release(&mut self) {
        let used = std::mem::replace(self.cursor.get_mut(), 0);
        let contention = std::mem::replace(self.contention.get_mut(), 0);
        if contention > HIGH_CONTENTION {
            tracing::warn!(contention, used, "high CAS contention on lock-free allocator");
        }
        self.guard.fill(&mut self.arena, 0..used);
        tracing::trace!(used, "lock-free allocator released");
    }
}

impl std::fmt::Debug for LockFreeLinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockFreeLinearAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("contention", &self.contention())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unguarded(capacity: usize) -> LockFreeLinearAllocator {
        LockFreeLinearAllocator::with_config(capacity, &AllocatorConfig::default().with_guards(false))
    }

    #[test]
    fn test_sequential_allocation() {
        let linear = unguarded(1024);
        let a = linear.allocate_aligned(100, 1).unwrap();
        let b = linear.allocate_aligned(100, 1).unwrap();
        assert_eq!(a, Allocation::new(0, 100));
        assert_eq!(b, Allocation::new(100, 100));
        assert_eq!(linear.remaining(), 824);
        assert!(linear.allocate_aligned(900, 1).is_none());
        assert_eq!(linear.used(), 200);
    }

    #[test]
    fn test_alignment() {
        let linear = unguarded(4096);
        let _ = linear.allocate_aligned(3, 1).unwrap();
        for align in [2, 8, 64, 256] {
            let a = linear.allocate_aligned(1, align).unwrap();
            assert_eq!((linear.arena.base_addr() + a.offset()) % align, 0);
        }
    }

    #[test]
    fn test_overflow_returns_none() {
        let linear = unguarded(64);
        assert!(linear.allocate(usize::MAX).is_none());
        assert!(linear.allocate(usize::MAX - 8).is_none());
        assert_eq!(linear.used(), 0);
    }

    #[test]
    fn test_allocate_bytes_and_release() {
        let mut linear = unguarded(256);
        {
            let a = linear.allocate_bytes(16, 8).unwrap();
            let b = linear.allocate_bytes(16, 8).unwrap();
            a.fill(1);
            b.fill(2);
            assert!(a.iter().all(|&x| x == 1));
        }
        linear.release();
        assert_eq!(linear.used(), 0);
        assert_eq!(linear.contention(), 0);
        let again = linear.allocate(16).unwrap();
        assert_eq!(linear.bytes_mut(again), &[1; 16]);
    }

    #[test]
    fn test_alloc_slice() {
        let linear = unguarded(1024);
        let values = linear.alloc_slice::<u32>(16).unwrap();
        assert!(values.iter().all(|&v| v == 0));
        values[15] = 7;
        assert!(linear.alloc_slice::<u64>(1024).is_none());
    }

    #[test]
    #[should_panic(expected = "invalid alignment")]
    fn test_guarded_invalid_alignment() {
        let linear =
            LockFreeLinearAllocator::with_config(64, &AllocatorConfig::default().with_guards(true));
        let _ = linear.allocate_aligned(8, 3);
    }

    #[test]
    fn test_unguarded_invalid_alignment_returns_none() {
        let linear = unguarded(64);
        assert!(linear.allocate_aligned(8, 3).is_none());
    }
}
