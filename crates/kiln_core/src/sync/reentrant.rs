//! # Reentrant Spin Lock
//!
//! A spin lock the owning thread may acquire again without deadlocking.

#![allow(unsafe_code)]

use std::hint;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Owner value meaning "not held".
const NO_OWNER: usize = 0;

/// Non-zero token unique to each live thread: the address of a
/// thread-local.
#[inline]
fn current_thread_token() -> usize {
    thread_local!(static TOKEN: u8 = const { 0 });
    TOKEN.with(|token| token as *const u8 as usize)
}

/// A recursive spin lock.
///
/// The owner token and a recursion counter track who holds the lock and
/// how often. Guards only give shared access, since nested guards on the
/// same thread alias each other; use interior mutability for writes.
pub struct ReentrantSpinLock<T> {
    owner: AtomicUsize,
    /// Recursion depth; only touched by the owning thread.
    count: AtomicUsize,
    data: T,
}

// SAFETY: `T` is only reachable through a guard, and guards of different
// threads never coexist.
unsafe impl<T: Send> Sync for ReentrantSpinLock<T> {}

impl<T> ReentrantSpinLock<T> {
    /// Wraps `value` in an unlocked lock.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            count: AtomicUsize::new(0),
            data: value,
        }
    }

    /// Acquires the lock, spinning while another thread holds it.
    ///
    /// # Panics
    ///
    /// Panics if the recursion depth overflows.
    pub fn lock(&self) -> ReentrantSpinLockGuard<'_, T> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Relaxed) == me {
            self.increment();
        } else {
            while self
                .owner
                .compare_exchange_weak(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                    hint::spin_loop();
                }
            }
            self.count.store(1, Ordering::Relaxed);
        }
        ReentrantSpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquires the lock if it is free or already held by this thread.
    pub fn try_lock(&self) -> Option<ReentrantSpinLockGuard<'_, T>> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Relaxed) == me {
            self.increment();
        } else if self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.count.store(1, Ordering::Relaxed);
        } else {
            return None;
        }
        Some(ReentrantSpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Whether any thread holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    /// Whether the calling thread holds the lock.
    #[inline]
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_token()
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consumes the lock and returns the value.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data
    }

    fn increment(&self) {
        let depth = self.count.load(Ordering::Relaxed);
        let depth = depth
            .checked_add(1)
            .unwrap_or_else(|| panic!("reentrant lock recursion overflow"));
        self.count.store(depth, Ordering::Relaxed);
    }

    fn unlock(&self) {
        let depth = self.count.load(Ordering::Relaxed) - 1;
        self.count.store(depth, Ordering::Relaxed);
        if depth == 0 {
            self.owner.store(NO_OWNER, Ordering::Release);
        }
    }
}

impl<T: Default> Default for ReentrantSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReentrantSpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => f
                .debug_struct("ReentrantSpinLock")
                .field("data", &&*guard)
                .finish(),
            None => f
                .debug_struct("ReentrantSpinLock")
                .field("data", &format_args!("<locked>"))
                .finish(),
        }
    }
}

/// Shared access to the value in a [`ReentrantSpinLock`].
///
/// Dropping the last guard of the owning thread releases the lock. Guards
/// are not `Send`: they must be dropped by the thread that took them.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantSpinLockGuard<'a, T> {
    lock: &'a ReentrantSpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

// SAFETY: sharing the guard only shares `&T`, which requires `T: Sync`.
unsafe impl<T: Sync> Sync for ReentrantSpinLockGuard<'_, T> {}

impl<T> Deref for ReentrantSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reentrant_acquire() {
        let lock = ReentrantSpinLock::new(Cell::new(0));
        let outer = lock.lock();
        let inner = lock.lock();
        inner.set(inner.get() + 1);
        assert_eq!(outer.get(), 1);
        assert!(lock.is_owned_by_current_thread());

        drop(inner);
        assert!(lock.is_locked());
        drop(outer);
        assert!(!lock.is_locked());
        assert!(!lock.is_owned_by_current_thread());
    }

    #[test]
    fn test_try_lock_from_other_thread_fails() {
        let lock = Arc::new(ReentrantSpinLock::new(0u32));
        let guard = lock.lock();
        assert!(lock.try_lock().is_some());

        let other = Arc::clone(&lock);
        let acquired = thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(!acquired);

        drop(guard);
        let other = Arc::clone(&lock);
        let acquired = thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(acquired);
    }

    #[test]
    fn test_recursive_function() {
        fn depth(lock: &ReentrantSpinLock<Vec<u32>>, n: u32) -> u32 {
            let guard = lock.lock();
            if n == 0 {
                guard.len() as u32
            } else {
                depth(lock, n - 1) + 1
            }
        }

        let lock = ReentrantSpinLock::new(vec![1, 2, 3]);
        assert_eq!(depth(&lock, 10), 13);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        use std::sync::atomic::AtomicU64;

        const THREADS: usize = 4;
        const ITERATIONS: u64 = 5_000;

        let lock = Arc::new(ReentrantSpinLock::new(AtomicU64::new(0)));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let outer = lock.lock();
                        let inner = lock.lock();
                        // Split load/store: only exclusion keeps it exact.
                        let value = inner.load(Ordering::Relaxed);
                        outer.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            lock.lock().load(Ordering::Relaxed),
            THREADS as u64 * ITERATIONS
        );
    }
}
