//! # Pool Allocator
//!
//! Fixed-size block allocator for objects that are frequently allocated and freed.

use crate::config::AllocatorConfig;
use crate::diagnostics::Fault;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::alignment::{checked_align_up, WORD};
use crate::memory::arena::{Arena, NIL};
use crate::memory::guard::Guard;
use crate::memory::{Allocation, ArenaAllocator};

/// A pool of equally sized blocks carved from one arena.
///
/// Free blocks form a singly-linked list threaded through their first word,
/// so allocation and deallocation are both O(1) and the most recently freed
/// block is handed out next.
///
/// Every block starts on a multiple of the configured alignment: the stride
/// is the block size rounded up to it.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. Use one pool per thread or wrap it in a
/// [`SpinLock`](crate::sync::SpinLock).
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = PoolAllocator::new(32, 4);
///
/// // Allocate - O(1), no heap allocation
/// let packet = pool.allocate().unwrap();
/// pool.bytes_mut(packet)[0] = 0x7F;
///
/// // Free - O(1), no heap deallocation
/// pool.deallocate(packet);
/// ```
pub struct PoolAllocator {
    /// Backing bytes, `capacity * stride` long.
    arena: Arena,
    /// Payload size requested at construction.
    block_size: usize,
    /// Distance between consecutive blocks.
    stride: usize,
    /// Number of blocks.
    capacity: usize,
    /// Offset of the first free block, or [`NIL`].
    head: usize,
    /// Number of blocks handed out.
    allocated_count: usize,
    /// Live flag per block; empty when guards are off.
    live: Box<[bool]>,
    /// Debug guards.
    guard: Guard,
}

impl PoolAllocator {
    /// Creates a pool of `capacity` blocks of `block_size` bytes.
    ///
    /// All memory is reserved upfront.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero or the pool size overflows.
    #[must_use]
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self::with_config(block_size, capacity, &AllocatorConfig::default())
    }

    /// Creates a pool with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the geometry or configuration is invalid.
    #[must_use]
    pub fn with_config(block_size: usize, capacity: usize, config: &AllocatorConfig) -> Self {
        Self::try_with_config(block_size, capacity, config)
            .unwrap_or_else(|e| panic!("pool allocator: {e}"))
    }

    /// Creates a pool, reporting invalid parameters as errors.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidPoolGeometry`] if either argument is
    /// zero, [`MemoryError::CapacityOverflow`] if the arena size overflows,
    /// or the configuration's validation error.
    pub fn try_with_config(
        block_size: usize,
        capacity: usize,
        config: &AllocatorConfig,
    ) -> MemoryResult<Self> {
        if block_size == 0 || capacity == 0 {
            return Err(MemoryError::InvalidPoolGeometry {
                block_size,
                capacity,
            });
        }
        config.validate()?;

        let stride = checked_align_up(block_size.max(WORD), config.alignment.max(WORD))
            .ok_or(MemoryError::CapacityOverflow(block_size))?;
        let bytes = stride
            .checked_mul(capacity)
            .ok_or(MemoryError::CapacityOverflow(capacity))?;

        let guard = Guard::new("pool", config);
        let arena = Arena::reserve(bytes, config.alignment, guard.initial_fill(), &config.backing)?;
        let live = if guard.enabled() {
            vec![false; capacity].into_boxed_slice()
        } else {
            Box::default()
        };

        let mut pool = Self {
            arena,
            block_size,
            stride,
            capacity,
            head: NIL,
            allocated_count: 0,
            live,
            guard,
        };
        pool.thread_free_list();
        Ok(pool)
    }

    /// Links every block to its successor; the last one ends the list.
    fn thread_free_list(&mut self) {
        for index in 0..self.capacity {
            let offset = index * self.stride;
            let next = if index + 1 < self.capacity {
                offset + self.stride
            } else {
                NIL
            };
            self.arena.write_word(offset, next);
        }
        self.head = 0;
    }

    /// Returns the total number of blocks.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the payload size of each block.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the distance in bytes between consecutive blocks.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Returns the number of blocks currently handed out.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Returns the number of free blocks.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.capacity.saturating_sub(self.allocated_count)
    }

    /// Takes one block off the free list.
    ///
    /// This is a **O(1)** operation with **zero heap allocations**.
    ///
    /// # Returns
    ///
    /// The block, or `None` if the pool is exhausted.
    pub fn allocate(&mut self) -> Option<Allocation> {
        if self.head == NIL {
            tracing::trace!(capacity = self.capacity, "pool exhausted");
            return None;
        }
        let offset = self.head;
        if self.guard.enabled() {
            // The payload past the link word must be untouched since the free.
            self.guard
                .verify_fill(&self.arena, offset + WORD..offset + self.stride);
            self.live[offset / self.stride] = true;
        }
        self.head = self.arena.read_word(offset);
        self.allocated_count += 1;
        Some(Allocation::new(offset, self.block_size))
    }

    /// Pushes a block back onto the free list.
    ///
    /// This is a **O(1)** operation with **zero heap deallocations**.
    /// Without guards the handle is trusted: freeing a block twice links it
    /// into the free list twice, so it will be handed out to two owners and
    /// the counters stop being meaningful. With guards a foreign or already
    /// free block is reported as a fault.
    pub fn deallocate(&mut self, allocation: Allocation) {
        let offset = allocation.offset();
        if self.guard.enabled() {
            if offset % self.stride != 0 || offset / self.stride >= self.capacity {
                self.guard.raise(&Fault::ForeignPointer { offset });
            }
            let index = offset / self.stride;
            if !self.live[index] {
                self.guard.raise(&Fault::DoubleFree { offset });
            }
            self.live[index] = false;
            self.guard
                .fill(&mut self.arena, offset + WORD..offset + self.stride);
        }
        self.arena.write_word(offset, self.head);
        self.head = offset;
        self.allocated_count = self.allocated_count.saturating_sub(1);
    }

    /// Returns every block to the pool, invalidating all handles.
    pub fn reset(&mut self) {
        let end = self.arena.capacity();
        self.guard.fill(&mut self.arena, 0..end);
        self.live.fill(false);
        self.thread_free_list();
        self.allocated_count = 0;
    }
}

impl ArenaAllocator for PoolAllocator {
    /// Hands out one block if `size` fits in it.
    fn allocate(&mut self, size: usize) -> Option<Allocation> {
        if size > self.block_size {
            return None;
        }
        Self::allocate(self)
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

impl std::fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("block_size", &self.block_size)
            .field("stride", &self.stride)
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated_count)
            .field("guards", &self.guard.enabled())
            .finish()
    }
}
