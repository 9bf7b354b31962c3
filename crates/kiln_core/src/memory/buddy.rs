//! # Buddy Allocator
//!
//! Power-of-two blocks split on demand and merged with their buddy on free.
//!
//! The arena holds `2^max_order` bytes. Free blocks of each order form a
//! doubly-linked list threaded through the block itself (next at word 0,
//! prev at word 1), which is why the smallest block is 16 bytes. A side
//! table with one byte per minimum-size granule records which granules
//! start a free block and of which order, so the merge check is O(1).

use crate::config::AllocatorConfig;
use crate::diagnostics::Fault;
use crate::error::{MemoryError, MemoryResult};
use crate::memory::alignment::{ceil_log2, WORD};
use crate::memory::arena::{Arena, NIL};
use crate::memory::guard::Guard;
use crate::memory::{Allocation, ArenaAllocator};

/// Smallest supported order: a free block must hold two link words.
const MIN_ORDER: u32 = 4;

/// Largest alignment requested for the arena base.
const MAX_BASE_ALIGN_ORDER: u32 = 12;

/// Binary buddy allocator over a `2^max_order`-byte arena.
///
/// # Example
///
/// ```rust,ignore
/// let mut buddy = BuddyAllocator::new(4, 10); // 16B..1KB blocks
///
/// let a = buddy.allocate(100).unwrap(); // 128-byte block
/// buddy.deallocate(a);                  // merges back into one 1KB block
/// ```
pub struct BuddyAllocator {
    arena: Arena,
    min_order: u32,
    max_order: u32,
    /// Free-list head per order, indexed by `order - min_order`.
    heads: Box<[usize]>,
    /// Per granule: `order + 1` if a free block starts here, else 0.
    free_order: Box<[u8]>,
    /// Per granule: `order + 1` if a live block starts here, else 0.
    /// Empty when guards are off.
    live_order: Box<[u8]>,
    guard: Guard,
}

impl BuddyAllocator {
    /// Creates an allocator for blocks of `2^min_order..=2^max_order` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the order range is invalid.
    #[must_use]
    pub fn new(min_order: u32, max_order: u32) -> Self {
        Self::with_config(min_order, max_order, &AllocatorConfig::default())
    }

    /// Creates an allocator with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the order range or configuration is invalid.
    #[must_use]
    pub fn with_config(min_order: u32, max_order: u32, config: &AllocatorConfig) -> Self {
        Self::try_with_config(min_order, max_order, config)
            .unwrap_or_else(|e| panic!("buddy allocator: {e}"))
    }

    /// Creates an allocator, reporting invalid parameters as errors.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidOrderRange`] unless
    /// `4 <= min_order <= max_order <= usize::BITS - 2`, or the
    /// configuration's validation error.
    pub fn try_with_config(
        min_order: u32,
        max_order: u32,
        config: &AllocatorConfig,
    ) -> MemoryResult<Self> {
        if min_order < MIN_ORDER || min_order > max_order || max_order > usize::BITS - 2 {
            return Err(MemoryError::InvalidOrderRange {
                min: min_order,
                max: max_order,
            });
        }
        config.validate()?;

        let guard = Guard::new("buddy", config);
        let alignment = config
            .alignment
            .max(1 << max_order.min(MAX_BASE_ALIGN_ORDER));
        let arena = Arena::reserve(1 << max_order, alignment, guard.initial_fill(), &config.backing)?;

        let levels = (max_order - min_order + 1) as usize;
        let granules = 1usize << (max_order - min_order);
        let live_order = if guard.enabled() {
            vec![0; granules].into_boxed_slice()
        } else {
            Box::default()
        };

        let mut buddy = Self {
            arena,
            min_order,
            max_order,
            heads: vec![NIL; levels].into_boxed_slice(),
            free_order: vec![0; granules].into_boxed_slice(),
            live_order,
            guard,
        };
        buddy.push(max_order, 0);
        Ok(buddy)
    }

    /// Smallest block order.
    #[inline]
    #[must_use]
    pub const fn min_order(&self) -> u32 {
        self.min_order
    }

    /// Largest block order; the arena is one block of this order.
    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> u32 {
        self.max_order
    }

    /// Order of the block that would serve a request of `bytes`, or `None`
    /// if it exceeds the arena.
    #[inline]
    #[must_use]
    pub const fn order_for(&self, bytes: usize) -> Option<u32> {
        let order = ceil_log2(bytes);
        let order = if order < self.min_order {
            self.min_order
        } else {
            order
        };
        if order > self.max_order {
            None
        } else {
            Some(order)
        }
    }

    /// Allocates the smallest block that holds `bytes`.
    ///
    /// The returned size is the full power-of-two block size.
    pub fn allocate(&mut self, bytes: usize) -> Option<Allocation> {
        let order = self.order_for(bytes)?;
        let Some(found) = (order..=self.max_order).find(|&o| self.heads[self.level(o)] != NIL)
        else {
            tracing::trace!(bytes, order, "buddy allocator exhausted");
            return None;
        };

        let offset = self.pop(found);
        let mut current = found;
        while current > order {
            current -= 1;
            self.push(current, offset + (1 << current));
        }

        let size = 1usize << order;
        if self.guard.enabled() {
            self.guard
                .verify_fill(&self.arena, offset + 2 * WORD..offset + size);
            let granule = self.granule(offset);
            self.live_order[granule] = order_tag(order);
        }
        Some(Allocation::new(offset, size))
    }

    /// Returns a block and merges it with free buddies.
    ///
    /// The block order is derived from the allocation size. With guards a
    /// foreign offset, a block that is not live, or a size different from
    /// the one handed out is reported as a fault.
    pub fn deallocate(&mut self, allocation: Allocation) {
        let mut offset = allocation.offset();
        let mut order = if self.guard.enabled() {
            self.check_deallocation(allocation)
        } else {
            ceil_log2(allocation.size()).clamp(self.min_order, self.max_order)
        };
        self.guard
            .fill(&mut self.arena, offset..offset + (1 << order));

        while order < self.max_order {
            let buddy = offset ^ (1 << order);
            if self.free_order[self.granule(buddy)] != order_tag(order) {
                break;
            }
            self.unlink(order, buddy);
            self.guard.fill(&mut self.arena, buddy..buddy + 2 * WORD);
            offset = offset.min(buddy);
            order += 1;
        }
        self.push(order, offset);
    }

    /// Validates a guarded free and returns the block order.
    fn check_deallocation(&mut self, allocation: Allocation) -> u32 {
        let offset = allocation.offset();
        if offset >= self.arena.capacity() || offset & ((1 << self.min_order) - 1) != 0 {
            self.guard.raise(&Fault::ForeignPointer { offset });
        }
        let granule = self.granule(offset);
        let tag = self.live_order[granule];
        if tag == 0 {
            self.guard.raise(&Fault::DoubleFree { offset });
        }
        let order = u32::from(tag) - 1;
        if allocation.size() != 1 << order {
            self.guard.raise(&Fault::SizeMismatch {
                offset,
                allocated: 1 << order,
                freed: allocation.size(),
            });
        }
        self.live_order[granule] = 0;
        order
    }

    /// Number of free blocks per order, smallest order first.
    #[must_use]
    pub fn free_block_counts(&self) -> Vec<(u32, usize)> {
        (self.min_order..=self.max_order)
            .map(|order| {
                let mut count = 0;
                let mut cursor = self.heads[self.level(order)];
                while cursor != NIL {
                    count += 1;
                    cursor = self.arena.read_word(cursor);
                }
                (order, count)
            })
            .collect()
    }

    /// Total bytes held in free blocks.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_block_counts()
            .into_iter()
            .map(|(order, count)| count << order)
            .sum()
    }

    #[inline]
    fn level(&self, order: u32) -> usize {
        (order - self.min_order) as usize
    }

    #[inline]
    fn granule(&self, offset: usize) -> usize {
        offset >> self.min_order
    }

    fn push(&mut self, order: u32, offset: usize) {
        let level = self.level(order);
        let next = self.heads[level];
        self.arena.write_word(offset, next);
        self.arena.write_word(offset + WORD, NIL);
        if next != NIL {
            self.arena.write_word(next + WORD, offset);
        }
        self.heads[level] = offset;
        let granule = self.granule(offset);
        self.free_order[granule] = order_tag(order);
    }

    fn unlink(&mut self, order: u32, offset: usize) {
        let next = self.arena.read_word(offset);
        let prev = self.arena.read_word(offset + WORD);
        if prev == NIL {
            let level = self.level(order);
            self.heads[level] = next;
        } else {
            self.arena.write_word(prev, next);
        }
        if next != NIL {
            self.arena.write_word(next + WORD, prev);
        }
        let granule = self.granule(offset);
        self.free_order[granule] = 0;
    }

    fn pop(&mut self, order: u32) -> usize {
        let head = self.heads[self.level(order)];
        self.unlink(order, head);
        head
    }
}

/// Side-table encoding of an order; 0 means "no block starts here".
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn order_tag(order: u32) -> u8 {
    (order + 1) as u8
}

impl ArenaAllocator for BuddyAllocator {
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

impl std::fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("min_order", &self.min_order)
            .field("max_order", &self.max_order)
            .field("free_bytes", &self.free_bytes())
            .field("guards", &self.guard.enabled())
            .finish()
    }
}
