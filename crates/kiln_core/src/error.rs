//! # Memory Error Types
//!
//! Errors raised while constructing or validating allocators.
//!
//! Running out of arena space is never an error: `allocate` returns `None`.

use thiserror::Error;

/// Errors that can occur while setting up or inspecting an allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// An alignment that is not a non-zero power of two.
    #[error("invalid alignment: {0} is not a power of two")]
    InvalidAlignment(usize),

    /// The requested capacity cannot hold a single allocation.
    #[error("capacity too small: requested {requested} bytes, minimum is {minimum}")]
    CapacityTooSmall {
        /// Capacity that was requested.
        requested: usize,
        /// Smallest capacity this allocator accepts.
        minimum: usize,
    },

    /// The requested capacity overflows the address space once aligned.
    #[error("capacity overflow: {0} bytes cannot be laid out")]
    CapacityOverflow(usize),

    /// Buddy order bounds are inverted or out of range.
    #[error("invalid order range: min {min}, max {max}")]
    InvalidOrderRange {
        /// Smallest block order.
        min: u32,
        /// Largest block order.
        max: u32,
    },

    /// A pool was asked for zero blocks or zero-sized blocks.
    #[error("invalid pool geometry: block size {block_size}, capacity {capacity}")]
    InvalidPoolGeometry {
        /// Requested block size in bytes.
        block_size: usize,
        /// Requested block count.
        capacity: usize,
    },

    /// An allocation's bytes could not be viewed as the requested type.
    #[error("invalid cast: {0}")]
    InvalidCast(String),

    /// The allocation does not belong to this allocator's arena.
    #[error("allocation {offset}+{size} is outside the arena of {capacity} bytes")]
    OutOfBounds {
        /// Offset of the rejected allocation.
        offset: usize,
        /// Size of the rejected allocation.
        size: usize,
        /// Arena capacity.
        capacity: usize,
    },

    /// Heap bookkeeping is inconsistent.
    #[error("heap corrupted at offset {offset}: {reason}")]
    HeapCorrupted {
        /// Offset of the offending block header.
        offset: usize,
        /// What went wrong.
        reason: String,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
