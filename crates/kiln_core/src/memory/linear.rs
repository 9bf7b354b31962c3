//! # Linear Allocator
//!
//! A bump allocator for temporary allocations that are freed all at once.

use bytemuck::Pod;

use crate::config::AllocatorConfig;
use crate::diagnostics::Fault;
use crate::error::MemoryResult;
use crate::memory::alignment::{padding_for, DEFAULT_ALIGNMENT};
use crate::memory::arena::Arena;
use crate::memory::guard::Guard;
use crate::memory::{Allocation, ArenaAllocator};

/// Bytes reserved in front of every payload when guards are enabled.
const SIGNATURE_SIZE: usize = 8;

/// A saved cursor position, see [`LinearAllocator::rewind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinearMarker(usize);

/// A bump-pointer allocator over a fixed arena.
///
/// Allocations are fast (just bump a cursor). Memory is freed all at once
/// with [`release`](Self::release), back to a [`LinearMarker`], or one
/// allocation at a time in strict LIFO order.
///
/// # Thread Safety
///
/// NOT thread-safe. Use one allocator per thread, wrap it in a
/// [`SpinLock`](crate::sync::SpinLock), or use
/// [`LockFreeLinearAllocator`](crate::sync::LockFreeLinearAllocator).
///
/// # Example
///
/// ```rust,ignore
/// let mut frame = LinearAllocator::new(1024 * 1024); // 1MB
///
/// let scratch = frame.alloc_slice::<f32>(1000).unwrap();
/// scratch[0] = 1.0;
///
/// // End of frame: everything goes at once
/// frame.release();
/// ```
pub struct LinearAllocator {
    /// Backing bytes.
    arena: Arena,
    /// Offset of the first unallocated byte.
    cursor: usize,
    /// Debug guards.
    guard: Guard,
}

impl LinearAllocator {
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
        Self::try_with_config(capacity, config).unwrap_or_else(|e| panic!("linear allocator: {e}"))
    }

    /// Creates an allocator, reporting invalid parameters as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the capacity is zero or the configuration is
    /// invalid.
    pub fn try_with_config(capacity: usize, config: &AllocatorConfig) -> MemoryResult<Self> {
        config.validate()?;
        let guard = Guard::new("linear", config);
        let arena = Arena::reserve(capacity, config.alignment, guard.initial_fill(), &config.backing)?;
        Ok(Self {
            arena,
            cursor: 0,
            guard,
        })
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Bytes consumed so far, including padding and guard words.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Bytes left before the arena is exhausted.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    /// Allocates `size` bytes aligned to [`DEFAULT_ALIGNMENT`].
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// Returns `None` if the arena cannot fit the request, or if `align` is
    /// not a power of two (with guards enabled that is reported as a fault).
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<Allocation> {
        if !self.guard.check_alignment(align) {
            return None;
        }
        let header = if self.guard.enabled() { SIGNATURE_SIZE } else { 0 };
        let start = self.cursor.checked_add(header)?;
        let payload = start.checked_add(padding_for(self.arena.base_addr().wrapping_add(start), align))?;
        let end = payload.checked_add(size)?;
        if end > self.capacity() {
            tracing::trace!(size, align, remaining = self.remaining(), "linear allocator exhausted");
            return None;
        }

        if self.guard.enabled() {
            self.guard.verify_fill(&self.arena, self.cursor..end);
            self.arena
                .write_word(payload - SIGNATURE_SIZE, self.guard.live_signature());
        }

        self.cursor = end;
        Some(Allocation::new(payload, size))
    }

    /// Frees the most recent allocation.
    ///
    /// Only the allocation ending at the cursor can be freed; anything else
    /// is ignored. With guards enabled, misuse is reported as a fault
    /// instead: a block above the cursor is a double free, a missing
    /// signature is a foreign pointer, and an older block is an
    /// out-of-order free.
    pub fn deallocate(&mut self, allocation: Allocation) {
        if self.guard.enabled() {
            self.check_deallocation(allocation);
            let start = allocation.offset() - SIGNATURE_SIZE;
            self.guard.fill(&mut self.arena, start..self.cursor);
            self.cursor = start;
        } else if allocation.offset().checked_add(allocation.size()) == Some(self.cursor) {
            self.cursor = allocation.offset();
        } else {
            tracing::trace!(
                offset = allocation.offset(),
                cursor = self.cursor,
                "ignoring out-of-order linear free"
            );
        }
    }

    fn check_deallocation(&self, allocation: Allocation) {
        let offset = allocation.offset();
        let end = match offset.checked_add(allocation.size()) {
            Some(end) if offset >= SIGNATURE_SIZE && end <= self.capacity() => end,
            _ => self.guard.raise(&Fault::ForeignPointer { offset }),
        };
        if offset > self.cursor {
            self.guard.raise(&Fault::DoubleFree { offset });
        }
        if self.arena.read_word(offset - SIGNATURE_SIZE) != self.guard.live_signature() {
            self.guard.raise(&Fault::ForeignPointer { offset });
        }
        if end != self.cursor {
            self.guard.raise(&Fault::OutOfOrderFree {
                offset,
                expected_end: self.cursor,
            });
        }
    }

    /// Captures the current cursor.
    #[inline]
    #[must_use]
    pub fn marker(&self) -> LinearMarker {
        LinearMarker(self.cursor)
    }

    /// Frees everything allocated after `marker` was taken.
    ///
    /// # Panics
    ///
    /// Panics if `marker` lies beyond the cursor (it was taken before a
    /// later `release` or `rewind`).
    pub fn rewind(&mut self, marker: LinearMarker) {
        assert!(
            marker.0 <= self.cursor,
            "marker {} is beyond the cursor {}",
            marker.0,
            self.cursor
        );
        self.guard.fill(&mut self.arena, marker.0..self.cursor);
        self.cursor = marker.0;
    }

    /// Resets the allocator, invalidating all previous allocations.
    ///
    /// O(1) without guards; with guards the used region is refilled.
    #[inline]
    pub fn release(&mut self) {
        self.guard.fill(&mut self.arena, 0..self.cursor);
        self.cursor = 0;
    }

    /// Allocates a zeroed slice of `count` elements.
    ///
    /// Returns `None` if out of space or if `T` is zero-sized.
    pub fn alloc_slice<T: Pod>(&mut self, count: usize) -> Option<&mut [T]> {
        let size = std::mem::size_of::<T>().checked_mul(count)?;
        let allocation = self.allocate_aligned(size, std::mem::align_of::<T>())?;
        let bytes = &mut self.arena.as_mut_slice()[allocation.range()];
        bytes.fill(0);
        bytemuck::try_cast_slice_mut(bytes).ok()
    }
}

impl ArenaAllocator for LinearAllocator {
    fn allocate(&mut self, size: usize) -> Option<Allocation> {
        Self::allocate(self, size)
    }

    fn deallocate(&mut self, allocation: Allocation) {
        Self::deallocate(self, allocation);
    }

    fn arena(&self) -> &Arena {
        &self.arena
    }

    fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }
}

impl std::fmt::Debug for LinearAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("guards", &self.guard.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unguarded(capacity: usize) -> LinearAllocator {
        LinearAllocator::with_config(capacity, &AllocatorConfig::default().with_guards(false))
    }

    fn guarded(capacity: usize) -> LinearAllocator {
        LinearAllocator::with_config(capacity, &AllocatorConfig::default().with_guards(true))
    }

    #[test]
    fn test_linear_example_scenario() {
        let mut linear = unguarded(1024);
        assert!(linear.allocate_aligned(100, 1).is_some());
        assert_eq!(linear.remaining(), 924);
        assert!(linear.allocate_aligned(1000, 1).is_none());

        linear.release();
        assert_eq!(linear.used(), 0);
        assert!(linear.allocate_aligned(1000, 1).is_some());
    }

    #[test]
    fn test_linear_alignment() {
        let mut linear = unguarded(4096);
        let base = linear.arena.base_addr();
        let _ = linear.allocate_aligned(3, 1).unwrap();
        for align in [1, 2, 4, 8, 16, 32, 64] {
            let a = linear.allocate_aligned(5, align).unwrap();
            assert_eq!(a.offset() % align, 0);
            assert_eq!((base + a.offset()) % align, 0);
        }
    }

    #[test]
    fn test_linear_sequential_allocations_do_not_overlap() {
        let mut linear = guarded(1024);
        let a = linear.allocate(100).unwrap();
        let b = linear.allocate(100).unwrap();
        assert!(!a.overlaps(b));
        assert!(b.offset() >= a.end() + SIGNATURE_SIZE);
    }

    #[test]
    fn test_linear_lifo_deallocate() {
        let mut linear = unguarded(1024);
        let a = linear.allocate(64).unwrap();
        let used_after_a = linear.used();
        let b = linear.allocate(64).unwrap();

        linear.deallocate(b);
        assert_eq!(linear.used(), used_after_a);
        linear.deallocate(a);
        assert_eq!(linear.used(), 0);
    }

    #[test]
    fn test_linear_out_of_order_free_is_ignored_without_guards() {
        let mut linear = unguarded(1024);
        let a = linear.allocate(64).unwrap();
        let _b = linear.allocate(64).unwrap();
        let used = linear.used();
        linear.deallocate(a);
        assert_eq!(linear.used(), used);
    }

    #[test]
    fn test_linear_guarded_round_trip_restores_fill() {
        let mut linear = guarded(256);
        let a = linear.allocate(32).unwrap();
        linear.bytes_mut(a).fill(0x11);
        linear.deallocate(a);
        // Padding in front of the signature stays consumed until release.
        assert_eq!(linear.used(), a.offset() - SIGNATURE_SIZE);
        assert!(linear.arena.as_slice().iter().all(|&b| b == 0xCD));
        linear.release();
        assert_eq!(linear.used(), 0);
    }

    #[test]
    #[should_panic(expected = "out-of-order free")]
    fn test_linear_guarded_out_of_order_free() {
        let mut linear = guarded(1024);
        let a = linear.allocate(64).unwrap();
        let _b = linear.allocate(64).unwrap();
        linear.deallocate(a);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_linear_guarded_double_free() {
        let mut linear = guarded(1024);
        let _a = linear.allocate(64).unwrap();
        let b = linear.allocate(64).unwrap();
        linear.deallocate(b);
        linear.deallocate(b);
    }

    #[test]
    #[should_panic(expected = "foreign pointer")]
    fn test_linear_guarded_foreign_pointer() {
        let mut linear = guarded(1024);
        let a = linear.allocate(64).unwrap();
        linear.deallocate(Allocation::new(a.offset() + 16, a.size() - 16));
    }

    #[test]
    #[should_panic(expected = "foreign pointer")]
    fn test_linear_guarded_wrapping_handle_is_foreign() {
        let mut linear = guarded(1024);
        let _ = linear.allocate(64).unwrap();
        linear.deallocate(Allocation::new(usize::MAX - 4, 16));
    }

    #[test]
    fn test_linear_unguarded_wrapping_handle_is_ignored() {
        let mut linear = unguarded(1024);
        let _ = linear.allocate(64).unwrap();
        let used = linear.used();
        linear.deallocate(Allocation::new(usize::MAX - 4, 16));
        assert_eq!(linear.used(), used);
    }

    #[test]
    #[should_panic(expected = "buffer corruption")]
    fn test_linear_guarded_overflow_detected() {
        let mut linear = guarded(1024);
        let a = linear.allocate(16).unwrap();
        // Scribble past the end of `a`.
        linear.arena.as_mut_slice()[a.end() + 4] = 0;
        let _ = linear.allocate(16);
    }

    #[test]
    #[should_panic(expected = "invalid alignment")]
    fn test_linear_guarded_invalid_alignment() {
        let mut linear = guarded(1024);
        let _ = linear.allocate_aligned(8, 24);
    }

    #[test]
    fn test_linear_marker_rewind() {
        let mut linear = guarded(1024);
        let _keep = linear.allocate(64).unwrap();
        let marker = linear.marker();
        let used = linear.used();
        for _ in 0..4 {
            let _ = linear.allocate(32).unwrap();
        }
        linear.rewind(marker);
        assert_eq!(linear.used(), used);
        assert!(linear.allocate(32).is_some());
    }

    #[test]
    fn test_linear_alloc_slice() {
        let mut linear = unguarded(1024);
        let slice = linear.alloc_slice::<f32>(10).unwrap();
        assert_eq!(slice.len(), 10);
        assert!(slice.iter().all(|&v| v == 0.0));
        slice[3] = 2.5;
        assert!(linear.alloc_slice::<u64>(1000).is_none());
        assert_eq!(linear.alloc_slice::<u32>(0).map(|s| s.len()), Some(0));
    }

    #[test]
    fn test_linear_typed_views() {
        let mut linear = unguarded(1024);
        let a = linear.allocate_aligned(16, 8).unwrap();
        linear.cast_mut::<u64>(a).unwrap().copy_from_slice(&[7, 9]);
        assert_eq!(linear.cast::<u64>(a).unwrap(), &[7, 9]);
        assert!(linear.cast::<u64>(Allocation::new(a.offset(), 12)).is_err());
        assert!(linear.cast::<u8>(Allocation::new(1020, 16)).is_err());
    }

    #[test]
    fn test_linear_size_overflow_returns_none() {
        let mut linear = unguarded(64);
        assert!(linear.allocate(usize::MAX).is_none());
        assert!(linear.alloc_slice::<u64>(usize::MAX / 4).is_none());
    }
}
