//! # Spin Locks
//!
//! Test-and-test-and-set busy-wait locks for very short critical sections.
//!
//! ## Safety Note
//!
//! [`SpinLock`] hands out `&mut T` through an `UnsafeCell`; the lock flag
//! guarantees at most one guard exists at a time.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A bare test-and-test-and-set lock flag.
///
/// Waiters spin on a relaxed load and only attempt the acquiring CAS once
/// the lock looks free, so contended waiting stays in the local cache.
/// There is no fairness among waiters and no backoff beyond
/// [`std::hint::spin_loop`].
#[derive(Debug, Default)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates an unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Makes a single acquisition attempt.
    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Calling this without holding the lock releases someone else's
    /// critical section; use [`SpinLock`] to have guards do it.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the lock is currently held by anyone.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A spin lock protecting a value.
///
/// ## Usage
///
/// ```rust,ignore
/// let heap = SpinLock::new(SegregatedFreeListHeap::new(64 * 1024));
///
/// let block = heap.lock().allocate(256);
/// ```
#[derive(Default)]
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock moves `T` between threads but never shares it.
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: only one guard, and so one `&mut T`, exists at a time.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `value` in an unlocked lock.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Acquires the lock if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw.try_lock().then(|| SpinLockGuard { lock: self })
    }

    /// Whether the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f
                .debug_struct("SpinLock")
                .field("data", &format_args!("<locked>"))
                .finish(),
        }
    }
}

/// Exclusive access to the value in a [`SpinLock`]; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock and is borrowed mutably.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_raw_lock_unlock() {
        let lock = RawSpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_into_inner_and_get_mut() {
        let mut lock = SpinLock::new(vec![1, 2]);
        lock.get_mut().push(3);
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_debug_shows_locked_state() {
        let lock = SpinLock::new(7);
        assert_eq!(format!("{lock:?}"), "SpinLock { data: 7 }");
        let _guard = lock.lock();
        assert_eq!(format!("{lock:?}"), "SpinLock { data: <locked> }");
    }

    #[test]
    fn test_mutual_exclusion() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 10_000;

        // Non-atomic read-modify-write: lost updates show up without the lock.
        let counter = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut guard = counter.lock();
                        let value = *guard;
                        hint::spin_loop();
                        *guard = value + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), THREADS * ITERATIONS);
    }
}
