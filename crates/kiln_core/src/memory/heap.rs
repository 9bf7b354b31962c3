//! # Segregated Free-List Heap
//!
//! General-purpose allocator with boundary-tagged blocks, power-of-two size
//! classes, splitting and coalescing.
//!
//! ## Block Layout
//!
//! ```text
//! header (32 bytes)                            payload (>= 16 bytes)
//! +-----------+-----------+-----------+-----------+-----------+-----------+----
//! | size|used | prev_adj  | next_adj  | signature | next_free | prev_free | ...
//! +-----------+-----------+-----------+-----------+-----------+-----------+----
//! 0           8           16          24          32          40
//! ```
//!
//! Headers tile the arena with no gaps: following `next_adj` from offset 0
//! visits every block once and ends exactly at the arena end. The free-list
//! links overlay the first two payload words and are only meaningful while
//! the block is free.

use crate::config::AllocatorConfig;
use crate::diagnostics::Fault;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::alignment::{align_down, checked_align_up, floor_log2, DEFAULT_ALIGNMENT};
use crate::memory::arena::{Arena, NIL};
use crate::memory::guard::Guard;
use crate::memory::{Allocation, ArenaAllocator};

// Header slots.
const SIZE: usize = 0;
const PREV_ADJ: usize = 8;
const NEXT_ADJ: usize = 16;
const SIGNATURE: usize = 24;

// Free-list slots, relative to the payload.
const NEXT_FREE: usize = 0;
const PREV_FREE: usize = 8;

/// Low bit of the size slot: block is handed out.
const ALLOCATED: usize = 1;

/// Snapshot of heap occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Payload bytes in free blocks.
    pub free_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Number of blocks handed out.
    pub allocated_blocks: usize,
    /// Payload size of the largest free block.
    pub largest_free_block: usize,
}

/// Boundary-tag heap over one arena.
///
/// Bucket `i` holds free blocks whose payload lies in
/// `[16 * 2^i, 16 * 2^(i+1))`; the last bucket is open-ended.
///
/// # Thread Safety
///
/// NOT thread-safe. Wrap it in a [`SpinLock`](crate::sync::SpinLock) to
/// share it.
pub struct SegregatedFreeListHeap {
    arena: Arena,
    /// Free-list head per bucket.
    buckets: Box<[usize]>,
    guard: Guard,
}

impl SegregatedFreeListHeap {
    /// Bytes of metadata in front of every payload.
    pub const HEADER_SIZE: usize = 32;

    /// Smallest payload; room for the two free-list links.
    pub const MIN_BLOCK_SIZE: usize = 16;

    /// Payload sizes are multiples of this.
    pub const GRANULARITY: usize = DEFAULT_ALIGNMENT;

    /// Creates a heap over a `capacity`-byte arena with the default
    /// configuration.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` cannot hold one header and a minimum block.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, &AllocatorConfig::default())
    }

    /// Creates a heap with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the capacity or configuration is invalid.
    #[must_use]
    pub fn with_config(capacity: usize, config: &AllocatorConfig) -> Self {
        Self::try_with_config(capacity, config).unwrap_or_else(|e| panic!("heap allocator: {e}"))
    }

    /// Creates a heap, reporting invalid parameters as errors.
    ///
    /// `capacity` is rounded down to a multiple of 16.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::CapacityTooSmall`] if the rounded capacity
    /// cannot hold one header and a minimum block, or the configuration's
    /// validation error.
    pub fn try_with_config(capacity: usize, config: &AllocatorConfig) -> MemoryResult<Self> {
        config.validate()?;
        let capacity = align_down(capacity, Self::GRANULARITY);
        let minimum = Self::HEADER_SIZE + Self::MIN_BLOCK_SIZE;
        if capacity < minimum {
            return Err(MemoryError::CapacityTooSmall {
                requested: capacity,
                minimum,
            });
        }

        let guard = Guard::new("heap", config);
        let alignment = config.alignment.max(Self::GRANULARITY);
        let arena = Arena::reserve(capacity, alignment, guard.initial_fill(), &config.backing)?;

        let max_payload = capacity - Self::HEADER_SIZE;
        let bucket_count = floor_log2(max_payload / Self::GRANULARITY) as usize + 1;

        let mut heap = Self {
            arena,
            buckets: vec![NIL; bucket_count].into_boxed_slice(),
            guard,
        };
        heap.set_size(0, max_payload);
        heap.arena.write_word(PREV_ADJ, NIL);
        heap.arena.write_word(NEXT_ADJ, NIL);
        heap.insert_free(0);
        Ok(heap)
    }

    /// Arena size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Number of size classes.
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Allocates at least `bytes` bytes, 16-byte aligned.
    ///
    /// The returned size is the block's full payload, which may exceed the
    /// request by less than one header plus a minimum block.
    pub fn allocate(&mut self, bytes: usize) -> Option<Allocation> {
        let request = checked_align_up(bytes.max(Self::MIN_BLOCK_SIZE), Self::GRANULARITY)?;
        if request > self.capacity() {
            return None;
        }
        let Some(block) = self.find_fit(request) else {
            tracing::trace!(bytes, request, "heap exhausted");
            return None;
        };
        self.unlink_free(block);

        let payload = self.size_of(block);
        if payload - request >= Self::MIN_BLOCK_SIZE + Self::HEADER_SIZE {
            self.split(block, request);
        }

        let size = self.size_of(block);
        let offset = block + Self::HEADER_SIZE;
        if self.guard.enabled() {
            self.guard
                .verify_fill(&self.arena, offset + Self::MIN_BLOCK_SIZE..offset + size);
            self.arena
                .write_word(block + SIGNATURE, self.guard.live_signature());
        }
        self.arena.write_word(block + SIZE, size | ALLOCATED);
        Some(Allocation::new(offset, size))
    }

    /// First block in the starting bucket whose payload fits, else the
    /// head of the first non-empty larger bucket.
    fn find_fit(&self, request: usize) -> Option<usize> {
        let start = self.bucket_for(request);
        let mut cursor = self.buckets[start];
        while cursor != NIL {
            if self.size_of(cursor) >= request {
                return Some(cursor);
            }
            cursor = self.arena.read_word(cursor + Self::HEADER_SIZE + NEXT_FREE);
        }
        self.buckets[start + 1..]
            .iter()
            .copied()
            .find(|&head| head != NIL)
    }

    /// Shrinks `block` to `request` and frees the remainder.
    fn split(&mut self, block: usize, request: usize) {
        let payload = self.size_of(block);
        let rest = block + Self::HEADER_SIZE + request;
        let next = self.arena.read_word(block + NEXT_ADJ);

        self.set_size(rest, payload - request - Self::HEADER_SIZE);
        self.arena.write_word(rest + PREV_ADJ, block);
        self.arena.write_word(rest + NEXT_ADJ, next);
        if next != NIL {
            self.arena.write_word(next + PREV_ADJ, rest);
        }
        self.arena.write_word(block + NEXT_ADJ, rest);
        self.set_size(block, request);
        self.insert_free(rest);
    }

    /// Frees a payload and coalesces it with free neighbours.
    ///
    /// Without guards the handle is trusted; freeing a block that is not
    /// allocated is ignored. With guards a bad header signature is a
    /// foreign pointer and a block that is not allocated is a double free.
    pub fn deallocate(&mut self, allocation: Allocation) {
        let offset = allocation.offset();
        let mut block = if self.guard.enabled() {
            self.check_deallocation(offset)
        } else {
            match offset.checked_sub(Self::HEADER_SIZE) {
                Some(block) if self.is_allocated(block) => block,
                _ => {
                    tracing::trace!(offset, "ignoring free of unallocated heap block");
                    return;
                }
            }
        };

        let size = self.size_of(block);
        self.guard.fill(&mut self.arena, offset..offset + size);
        self.set_size(block, size);

        let prev = self.arena.read_word(block + PREV_ADJ);
        if prev != NIL && !self.is_allocated(prev) {
            self.unlink_free(prev);
            self.absorb_next(prev);
            block = prev;
        }
        let next = self.arena.read_word(block + NEXT_ADJ);
        if next != NIL && !self.is_allocated(next) {
            self.unlink_free(next);
            self.absorb_next(block);
        }
        self.insert_free(block);
    }

    /// Validates a guarded free and returns the block header offset.
    fn check_deallocation(&mut self, offset: usize) -> usize {
        if offset < Self::HEADER_SIZE
            || offset > self.capacity() - Self::MIN_BLOCK_SIZE
            || offset % Self::GRANULARITY != 0
        {
            self.guard.raise(&Fault::ForeignPointer { offset });
        }
        let block = offset - Self::HEADER_SIZE;
        let signature = self.arena.read_word(block + SIGNATURE);
        if signature == self.guard.dead_signature() {
            self.guard.raise(&Fault::DoubleFree { offset });
        }
        if signature != self.guard.live_signature() {
            // A block merged into a free neighbour lost its header.
            if self.free_block_containing(offset) {
                self.guard.raise(&Fault::DoubleFree { offset });
            }
            self.guard.raise(&Fault::ForeignPointer { offset });
        }
        if !self.is_allocated(block) {
            self.guard.raise(&Fault::DoubleFree { offset });
        }
        self.arena
            .write_word(block + SIGNATURE, self.guard.dead_signature());
        block
    }

    /// Whether `offset` lies in the payload of a free block.
    fn free_block_containing(&self, offset: usize) -> bool {
        let max_blocks = self.capacity() / (Self::HEADER_SIZE + Self::MIN_BLOCK_SIZE);
        let mut block = 0;
        for _ in 0..max_blocks {
            if block == NIL || block >= offset {
                return false;
            }
            let end = block + Self::HEADER_SIZE + self.size_of(block);
            if offset < end {
                return !self.is_allocated(block);
            }
            block = self.arena.read_word(block + NEXT_ADJ);
        }
        false
    }

    /// Merges the block physically after `block` into it. Both are free
    /// and out of their lists.
    fn absorb_next(&mut self, block: usize) {
        let next = self.arena.read_word(block + NEXT_ADJ);
        let after = self.arena.read_word(next + NEXT_ADJ);
        let merged = self.size_of(block) + Self::HEADER_SIZE + self.size_of(next);

        self.set_size(block, merged);
        self.arena.write_word(block + NEXT_ADJ, after);
        if after != NIL {
            self.arena.write_word(after + PREV_ADJ, block);
        }
        // The absorbed header and links are payload now.
        self.guard.fill(
            &mut self.arena,
            next..next + Self::HEADER_SIZE + Self::MIN_BLOCK_SIZE,
        );
    }

    /// Walks the adjacency chain and collects occupancy figures.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut block = 0;
        while block != NIL {
            let size = self.size_of(block);
            if self.is_allocated(block) {
                stats.allocated_blocks += 1;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free_block = stats.largest_free_block.max(size);
            }
            block = self.arena.read_word(block + NEXT_ADJ);
        }
        stats
    }

    /// Checks every structural invariant of the heap.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::HeapCorrupted`] naming the first block that
    /// breaks the adjacency chain, the coalescing rule or a free list.
    pub fn validate(&self) -> MemoryResult<()> {
        let capacity = self.capacity();
        let max_blocks = capacity / (Self::HEADER_SIZE + Self::MIN_BLOCK_SIZE);

        let mut free_in_chain = 0;
        let mut prev = NIL;
        let mut prev_free = false;
        let mut block = 0;
        let mut visited = 0;
        while block != NIL {
            visited += 1;
            if visited > max_blocks {
                return Err(corrupted(block, "adjacency chain does not terminate"));
            }
            let size = self.size_of(block);
            let end = block + Self::HEADER_SIZE + size;
            if size < Self::MIN_BLOCK_SIZE || size % Self::GRANULARITY != 0 || end > capacity {
                return Err(corrupted(block, "invalid block size"));
            }
            if self.arena.read_word(block + PREV_ADJ) != prev {
                return Err(corrupted(block, "prev_adjacent does not match"));
            }
            let free = !self.is_allocated(block);
            if free && prev_free {
                return Err(corrupted(block, "adjacent free blocks were not coalesced"));
            }
            let next = self.arena.read_word(block + NEXT_ADJ);
            if (next == NIL && end != capacity) || (next != NIL && next != end) {
                return Err(corrupted(block, "next_adjacent leaves a gap"));
            }
            free_in_chain += usize::from(free);
            prev_free = free;
            prev = block;
            block = next;
        }

        let mut free_in_lists = 0;
        for (bucket, &head) in self.buckets.iter().enumerate() {
            let mut prev = NIL;
            let mut block = head;
            while block != NIL {
                free_in_lists += 1;
                if free_in_lists > free_in_chain {
                    return Err(corrupted(block, "free lists hold more blocks than the chain"));
                }
                if self.is_allocated(block) {
                    return Err(corrupted(block, "allocated block on a free list"));
                }
                if self.bucket_for(self.size_of(block)) != bucket {
                    return Err(corrupted(block, "block filed under the wrong size class"));
                }
                let payload = block + Self::HEADER_SIZE;
                if self.arena.read_word(payload + PREV_FREE) != prev {
                    return Err(corrupted(block, "prev_free does not match"));
                }
                prev = block;
                block = self.arena.read_word(payload + NEXT_FREE);
            }
        }
        if free_in_lists != free_in_chain {
            return Err(corrupted(0, "free block missing from the free lists"));
        }
        Ok(())
    }

    #[inline]
    fn bucket_for(&self, size: usize) -> usize {
        (floor_log2(size / Self::GRANULARITY) as usize).min(self.buckets.len() - 1)
    }

    #[inline]
    fn size_of(&self, block: usize) -> usize {
        self.arena.read_word(block + SIZE) & !ALLOCATED
    }

    #[inline]
    fn is_allocated(&self, block: usize) -> bool {
        self.arena.read_word(block + SIZE) & ALLOCATED != 0
    }

    /// Stores `size` and marks the block free.
    #[inline]
    fn set_size(&mut self, block: usize, size: usize) {
        self.arena.write_word(block + SIZE, size);
    }

    fn insert_free(&mut self, block: usize) {
        let bucket = self.bucket_for(self.size_of(block));
        let payload = block + Self::HEADER_SIZE;
        let next = self.buckets[bucket];
        self.arena.write_word(payload + NEXT_FREE, next);
        self.arena.write_word(payload + PREV_FREE, NIL);
        if next != NIL {
            self.arena
                .write_word(next + Self::HEADER_SIZE + PREV_FREE, block);
        }
        self.buckets[bucket] = block;
    }

    fn unlink_free(&mut self, block: usize) {
        let payload = block + Self::HEADER_SIZE;
        let next = self.arena.read_word(payload + NEXT_FREE);
        let prev = self.arena.read_word(payload + PREV_FREE);
        if prev == NIL {
            let bucket = self.bucket_for(self.size_of(block));
            self.buckets[bucket] = next;
        } else {
            self.arena
                .write_word(prev + Self::HEADER_SIZE + NEXT_FREE, next);
        }
        if next != NIL {
            self.arena
                .write_word(next + Self::HEADER_SIZE + PREV_FREE, prev);
        }
    }
}

fn corrupted(offset: usize, reason: &str) -> MemoryError {
    MemoryError::HeapCorrupted {
        offset,
        reason: reason.to_owned(),
    }
}

impl ArenaAllocator for SegregatedFreeListHeap {
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

impl std::fmt::Debug for SegregatedFreeListHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegregatedFreeListHeap")
            .field("capacity", &self.capacity())
            .field("buckets", &self.buckets.len())
            .field("stats", &self.stats())
            .field("guards", &self.guard.enabled())
            .finish()
    }
}
