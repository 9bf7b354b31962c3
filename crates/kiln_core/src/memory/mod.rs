//! # Memory Management
//!
//! Arena-backed allocators for zero-allocation hot paths.
//!
//! ## Design Philosophy
//!
//! Every allocator reserves one arena at startup. After that:
//! - No heap allocations
//! - Allocation failure is `None`, never a panic
//! - Free-list links are offsets stored inside unused arena bytes
//!
//! Allocations are described by [`Allocation`] handles (offset + size).
//! Callers read and write through the allocator's byte or typed views, or
//! take a raw pointer with [`ArenaAllocator::as_ptr`].

pub mod alignment;
mod arena;
mod backing;
mod buddy;
pub(crate) mod guard;
mod heap;
mod linear;
mod pool;

use std::ops::Range;
use std::ptr::NonNull;

use bytemuck::Pod;

use crate::error::{MemoryError, MemoryResult};

pub use arena::{Arena, NIL};
pub use backing::{Backing, BackingAllocator, SystemHeap};
pub use buddy::BuddyAllocator;
pub use heap::{HeapStats, SegregatedFreeListHeap};
pub use linear::{LinearAllocator, LinearMarker};
pub use pool::PoolAllocator;

/// A byte range handed out by an allocator.
///
/// Handles are plain values: they do not borrow the allocator and do not
/// free anything when dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    offset: usize,
    size: usize,
}

impl Allocation {
    /// Creates a handle for `size` bytes at `offset`.
    #[inline]
    #[must_use]
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// Offset of the first payload byte from the arena base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.offset
    }

    /// Payload size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        self.size
    }

    /// Offset one past the last payload byte.
    #[inline]
    #[must_use]
    pub const fn end(self) -> usize {
        self.offset + self.size
    }

    /// Payload byte range.
    #[inline]
    #[must_use]
    pub const fn range(self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Whether the payload is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// Whether two handles share at least one byte.
    #[inline]
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Common surface of the single-owner arena allocators.
///
/// Implemented by [`LinearAllocator`], [`PoolAllocator`], [`BuddyAllocator`]
/// and [`SegregatedFreeListHeap`]. None of them are thread-safe; wrap one in
/// a [`SpinLock`](crate::sync::SpinLock) to share it.
pub trait ArenaAllocator {
    /// Allocates `size` bytes, or `None` when the arena cannot fit them.
    fn allocate(&mut self, size: usize) -> Option<Allocation>;

    /// Returns `allocation` to the allocator.
    fn deallocate(&mut self, allocation: Allocation);

    /// The arena backing this allocator.
    fn arena(&self) -> &Arena;

    /// The arena backing this allocator, mutably.
    fn arena_mut(&mut self) -> &mut Arena;

    /// Total arena size in bytes.
    fn capacity(&self) -> usize {
        self.arena().capacity()
    }

    /// Payload bytes of `allocation`.
    ///
    /// # Panics
    ///
    /// Panics if the allocation lies outside the arena.
    fn bytes(&self, allocation: Allocation) -> &[u8] {
        &self.arena().as_slice()[allocation.range()]
    }

    /// Payload bytes of `allocation`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the allocation lies outside the arena.
    fn bytes_mut(&mut self, allocation: Allocation) -> &mut [u8] {
        &mut self.arena_mut().as_mut_slice()[allocation.range()]
    }

    /// Views the payload as a slice of `T`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] for a foreign allocation and
    /// [`MemoryError::InvalidCast`] if the payload is misaligned for `T` or
    /// not a whole number of `T`s.
    fn cast<T: Pod>(&self, allocation: Allocation) -> MemoryResult<&[T]> {
        let bytes = self
            .arena()
            .as_slice()
            .get(allocation.range())
            .ok_or_else(|| out_of_bounds(allocation, self.capacity()))?;
        bytemuck::try_cast_slice(bytes).map_err(|e| MemoryError::InvalidCast(format!("{e:?}")))
    }

    /// Views the payload as a mutable slice of `T`.
    ///
    /// # Errors
    ///
    /// Same as [`cast`](Self::cast).
    fn cast_mut<T: Pod>(&mut self, allocation: Allocation) -> MemoryResult<&mut [T]> {
        let capacity = self.capacity();
        let bytes = self
            .arena_mut()
            .as_mut_slice()
            .get_mut(allocation.range())
            .ok_or_else(|| out_of_bounds(allocation, capacity))?;
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| MemoryError::InvalidCast(format!("{e:?}")))
    }

    /// Raw pointer to the first payload byte, for collaborators that hand
    /// memory to foreign code.
    ///
    /// # Panics
    ///
    /// Panics if the allocation starts outside the arena.
    fn as_ptr(&self, allocation: Allocation) -> NonNull<u8> {
        self.arena().ptr_at(allocation.offset())
    }
}

fn out_of_bounds(allocation: Allocation, capacity: usize) -> MemoryError {
    MemoryError::OutOfBounds {
        offset: allocation.offset(),
        size: allocation.size(),
        capacity,
    }
}
