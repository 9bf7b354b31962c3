//! # Fault Diagnostics
//!
//! Misuse detected by guarded allocators (double frees, foreign offsets,
//! overwritten guard bytes) is reported to a [`FaultHandler`] injected at
//! construction. Handlers never return: there is no meaningful way to keep
//! running on top of a corrupted arena.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Misuse detected while guards are enabled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The block at `offset` was already free.
    #[error("double free at offset {offset}")]
    DoubleFree {
        /// Payload offset passed to `deallocate`.
        offset: usize,
    },

    /// `offset` was never handed out by this allocator.
    #[error("foreign pointer freed at offset {offset}")]
    ForeignPointer {
        /// Payload offset passed to `deallocate`.
        offset: usize,
    },

    /// A stack-discipline allocator was asked to free something other than
    /// its most recent allocation.
    #[error("out-of-order free at offset {offset}: expected allocation ending at {expected_end}")]
    OutOfOrderFree {
        /// Payload offset passed to `deallocate`.
        offset: usize,
        /// Cursor the freed allocation should have ended at.
        expected_end: usize,
    },

    /// Guard bytes were altered, usually by a write past an allocation.
    #[error("buffer corruption at offset {offset}: expected {expected:#04x}, found {found:#04x}")]
    BufferCorruption {
        /// First corrupted byte.
        offset: usize,
        /// Fill byte that should have been there.
        expected: u8,
        /// Byte actually found.
        found: u8,
    },

    /// An alignment request that is not a power of two.
    #[error("invalid alignment {align}")]
    InvalidAlignment {
        /// Requested alignment.
        align: usize,
    },

    /// A block was freed with a size class it was not allocated with.
    #[error("size mismatch at offset {offset}: allocated {allocated} bytes, freed {freed}")]
    SizeMismatch {
        /// Payload offset passed to `deallocate`.
        offset: usize,
        /// Size recorded at allocation time.
        allocated: usize,
        /// Size passed to `deallocate`.
        freed: usize,
    },
}

/// Receives faults detected by guarded allocators.
///
/// Implementations must diverge (panic, abort, or exit).
pub trait FaultHandler: Send + Sync {
    /// Reports `fault` raised by the allocator named `source`.
    fn on_fault(&self, source: &'static str, fault: &Fault) -> !;
}

/// Logs the fault and panics.
///
/// With the workspace profiles (`panic = "abort"`) this terminates the
/// process; under the test harness it unwinds so `#[should_panic]` works.
#[derive(Clone, Copy, Debug, Default)]
pub struct PanicOnFault;

impl FaultHandler for PanicOnFault {
    fn on_fault(&self, source: &'static str, fault: &Fault) -> ! {
        tracing::error!(source, %fault, "allocator fault");
        panic!("{source}: {fault}");
    }
}

/// Logs the fault and aborts the process without unwinding.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbortOnFault;

impl FaultHandler for AbortOnFault {
    fn on_fault(&self, source: &'static str, fault: &Fault) -> ! {
        tracing::error!(source, %fault, "allocator fault, aborting");
        std::process::abort();
    }
}

/// Shared, cloneable handle to a [`FaultHandler`].
#[derive(Clone)]
pub struct FaultSink(Arc<dyn FaultHandler>);

impl FaultSink {
    /// Wraps a handler.
    pub fn new(handler: impl FaultHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// Forwards `fault` to the wrapped handler.
    #[cold]
    #[inline(never)]
    pub fn raise(&self, source: &'static str, fault: &Fault) -> ! {
        self.0.on_fault(source, fault)
    }
}

impl Default for FaultSink {
    fn default() -> Self {
        Self::new(PanicOnFault)
    }
}

impl fmt::Debug for FaultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FaultSink")
    }
}
