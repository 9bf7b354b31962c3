//! # SPSC Queue
//!
//! Bounded single-producer single-consumer ring buffer.
//!
//! ## Memory Ordering
//!
//! - **tail** (producer position): written with `Release` after the slot
//!   write, read by the consumer with `Acquire`.
//! - **head** (consumer position): written with `Release` after the slot
//!   read, read by the producer with `Acquire`.
//!
//! Each side keeps a private copy of the other side's counter and only
//! reloads it when the copy says full (producer) or empty (consumer), so
//! the shared cache lines are touched once per wrap in the steady state.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Storage shared by a [`Producer`] and a [`Consumer`].
///
/// Counters grow monotonically (wrapping); a slot index is `counter & mask`.
pub struct SpscQueue<T> {
    /// Next slot to read.
    head: CachePadded<AtomicUsize>,
    /// Next slot to write.
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slots in [head, tail) are owned by the consumer, the rest by the
// producer; the Release/Acquire pairs hand each slot over.
unsafe impl<T: Send> Send for SpscQueue<T> {}
// SAFETY: as above; the two handles never touch the same slot at once.
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Creates a queue holding at least `capacity` items and returns its
    /// two ends.
    ///
    /// The capacity is rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or cannot be rounded up.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Producer<T>, Consumer<T>) {
        assert!(capacity > 0, "Capacity must be greater than zero");
        let capacity = capacity
            .checked_next_power_of_two()
            .unwrap_or_else(|| panic!("capacity {capacity} too large"));

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let queue = Arc::new(Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
            slots,
        });

        let producer = Producer {
            queue: Arc::clone(&queue),
            tail: 0,
            cached_head: 0,
        };
        let consumer = Consumer {
            queue,
            head: 0,
            cached_tail: 0,
        };
        (producer, consumer)
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Items currently queued; a snapshot when the other side is active.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Whether no items are queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every slot is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    #[inline]
    fn slot(&self, position: usize) -> *mut MaybeUninit<T> {
        self.slots[position & self.mask].get()
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            // SAFETY: slots in [head, tail) hold initialized items and both
            // handles are gone.
            unsafe { (*self.slot(head)).assume_init_drop() };
            head = head.wrapping_add(1);
        }
    }
}

impl<T> std::fmt::Debug for SpscQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpscQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// The writing end of an [`SpscQueue`].
pub struct Producer<T> {
    queue: Arc<SpscQueue<T>>,
    /// Own copy of the tail; only this handle advances it.
    tail: usize,
    cached_head: usize,
}

impl<T> Producer<T> {
    /// Appends `value`, or hands it back if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` when all slots are occupied.
    pub fn enqueue(&mut self, value: T) -> Result<(), T> {
        let capacity = self.queue.capacity();
        if self.tail.wrapping_sub(self.cached_head) == capacity {
            self.cached_head = self.queue.head.load(Ordering::Acquire);
            if self.tail.wrapping_sub(self.cached_head) == capacity {
                return Err(value);
            }
        }
        // SAFETY: the slot is outside [head, tail), so the consumer is not
        // reading it, and it holds no live item.
        unsafe { (*self.queue.slot(self.tail)).write(value) };
        self.tail = self.tail.wrapping_add(1);
        self.queue.tail.store(self.tail, Ordering::Release);
        Ok(())
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Items currently queued.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no items are queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the next [`enqueue`](Self::enqueue) would fail, unless the
    /// consumer dequeues first.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Producer").field(&*self.queue).finish()
    }
}

/// The reading end of an [`SpscQueue`].
pub struct Consumer<T> {
    queue: Arc<SpscQueue<T>>,
    /// Own copy of the head; only this handle advances it.
    head: usize,
    cached_tail: usize,
}

impl<T> Consumer<T> {
    /// Removes the oldest item, or `None` if the queue is empty.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.head == self.cached_tail {
            self.cached_tail = self.queue.tail.load(Ordering::Acquire);
            if self.head == self.cached_tail {
                return None;
            }
        }
        // SAFETY: the slot is inside [head, tail); the Acquire load of the
        // tail made the producer's write visible.
        let value = unsafe { (*self.queue.slot(self.head)).assume_init_read() };
        self.head = self.head.wrapping_add(1);
        self.queue.head.store(self.head, Ordering::Release);
        Some(value)
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Items currently queued.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the next [`dequeue`](Self::dequeue) would return `None`,
    /// unless the producer enqueues first.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether every slot is occupied.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

impl<T> Iterator for Consumer<T> {
    type Item = T;

    /// Drains whatever is queued right now; stops at the first empty read.
    fn next(&mut self) -> Option<T> {
        self.dequeue()
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Consumer").field(&*self.queue).finish()
    }
}
