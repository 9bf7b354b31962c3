//! # Spin Semaphore
//!
//! A counting semaphore that busy-waits for a permit.

use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Admits at most `max_permits` holders at once.
///
/// The holder count is an atomic; acquiring is a TTAS loop on it and
/// releasing is a single decrement, so the count can never exceed the
/// limit.
#[derive(Debug)]
pub struct SpinSemaphore {
    holders: AtomicUsize,
    max_permits: usize,
}

impl SpinSemaphore {
    /// Creates a semaphore with `max_permits` permits.
    ///
    /// # Panics
    ///
    /// Panics if `max_permits` is zero.
    #[must_use]
    pub fn new(max_permits: usize) -> Self {
        assert!(max_permits > 0, "Semaphore needs at least one permit");
        Self {
            holders: AtomicUsize::new(0),
            max_permits,
        }
    }

    /// Spins until a permit is free and takes it.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            while self.holders.load(Ordering::Relaxed) >= self.max_permits {
                hint::spin_loop();
            }
        }
    }

    /// Takes a permit if one is free right now.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut current = self.holders.load(Ordering::Relaxed);
        while current < self.max_permits {
            match self.holders.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SemaphorePermit { semaphore: self }),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Returns a permit taken with [`forget`](SemaphorePermit::forget).
    ///
    /// # Panics
    ///
    /// Panics if no permit is held.
    pub fn release(&self) {
        let released = self
            .holders
            .fetch_update(Ordering::Release, Ordering::Relaxed, |n| n.checked_sub(1));
        assert!(released.is_ok(), "semaphore released more often than acquired");
    }

    /// Permits currently free.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_permits
            .saturating_sub(self.holders.load(Ordering::Relaxed))
    }

    /// Total number of permits.
    #[inline]
    #[must_use]
    pub const fn max_permits(&self) -> usize {
        self.max_permits
    }
}

/// A held permit; released on drop.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a SpinSemaphore,
}

impl SemaphorePermit<'_> {
    /// Keeps the permit taken after this value is gone. Give it back with
    /// [`SpinSemaphore::release`].
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
