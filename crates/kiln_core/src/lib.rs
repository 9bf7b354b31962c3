//! # KILN Core
//!
//! Arena allocators and spin-based synchronization for hot paths:
//! - Linear, pool, buddy and segregated free-list allocators
//! - A lock-free bump allocator and an SPSC ring buffer
//! - Spin lock, reentrant spin lock and spin semaphore
//!
//! ## Architecture Rules
//!
//! 1. **One reservation per allocator** - The arena is reserved at construction and released on drop
//! 2. **No panics on exhaustion** - Allocation failure is `None`
//! 3. **Misuse is loud in debug** - Guards detect double frees, foreign frees and overflows
//!
//! ## Example
//!
//! ```rust,ignore
//! use kiln_core::{ArenaAllocator, PoolAllocator, SpinLock};
//!
//! let pool = SpinLock::new(PoolAllocator::new(64, 1024));
//! let block = pool.lock().allocate().unwrap();
//! pool.lock().bytes_mut(block)[0] = 1;
//! pool.lock().deallocate(block);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::{AllocatorConfig, GuardConfig};
pub use diagnostics::{AbortOnFault, Fault, FaultHandler, FaultSink, PanicOnFault};
pub use error::{MemoryError, MemoryResult};
pub use memory::{
    Allocation, Arena, ArenaAllocator, Backing, BackingAllocator, BuddyAllocator, HeapStats,
    LinearAllocator, LinearMarker, PoolAllocator, SegregatedFreeListHeap, SystemHeap,
};
pub use sync::{
    Consumer, LockFreeLinearAllocator, Producer, RawSpinLock, ReentrantSpinLock, SemaphorePermit,
    SpinLock, SpinSemaphore, SpscQueue,
};
