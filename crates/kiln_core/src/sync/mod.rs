//! # Synchronization Primitives
//!
//! Busy-wait locks and lock-free structures for sharing allocators and
//! moving data between threads.
//!
//! ## Which One?
//!
//! ```text
//! Share a single-owner allocator       → SpinLock<LinearAllocator> (or Pool/Buddy/Heap)
//! Many threads bump-allocate at once   → LockFreeLinearAllocator
//! One thread hands items to another    → SpscQueue
//! Re-enter a lock on the same thread   → ReentrantSpinLock
//! Bound concurrent access to N holders → SpinSemaphore
//! ```
//!
//! Every wait is a spin without a timeout, and waiters are served in no
//! particular order, so critical sections must stay short.

mod lockfree_linear;
mod reentrant;
mod semaphore;
mod spin;
mod spsc;

pub use lockfree_linear::LockFreeLinearAllocator;
pub use reentrant::{ReentrantSpinLock, ReentrantSpinLockGuard};
pub use semaphore::{SemaphorePermit, SpinSemaphore};
pub use spin::{RawSpinLock, SpinLock, SpinLockGuard};
pub use spsc::{Consumer, Producer, SpscQueue};
