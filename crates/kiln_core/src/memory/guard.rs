//! Debug guards: fill patterns, block signatures and corruption checks.
//!
//! Every check is a no-op when guards are disabled, so allocators call
//! them unconditionally on the paths that need them.

use crate::config::AllocatorConfig;
use crate::diagnostics::{Fault, FaultSink};
use crate::memory::alignment::is_power_of_two;
use crate::memory::arena::Arena;

/// Guard state carried by one allocator instance.
#[derive(Clone, Debug)]
pub(crate) struct Guard {
    enabled: bool,
    fill_byte: u8,
    signature: usize,
    faults: FaultSink,
    source: &'static str,
}

impl Guard {
    // Truncates the signature on 32-bit targets; any fixed pattern works.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(source: &'static str, config: &AllocatorConfig) -> Self {
        Self {
            enabled: config.guards.enabled,
            fill_byte: config.guards.fill_byte,
            signature: config.guards.signature as usize,
            faults: config.faults.clone(),
            source,
        }
    }

    #[inline]
    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Byte the arena should be filled with at construction.
    #[inline]
    pub(crate) fn initial_fill(&self) -> u8 {
        if self.enabled {
            self.fill_byte
        } else {
            0
        }
    }

    /// Signature stamped on live blocks.
    #[inline]
    pub(crate) fn live_signature(&self) -> usize {
        self.signature
    }

    /// Signature left behind on freed blocks.
    #[inline]
    pub(crate) fn dead_signature(&self) -> usize {
        !self.signature
    }

    /// Overwrites `range` with the fill pattern.
    #[inline]
    pub(crate) fn fill(&self, arena: &mut Arena, range: std::ops::Range<usize>) {
        if self.enabled {
            arena.fill(range, self.fill_byte);
        }
    }

    /// Checks that `range` still holds the fill pattern.
    pub(crate) fn verify_fill(&self, arena: &Arena, range: std::ops::Range<usize>) {
        if !self.enabled {
            return;
        }
        let start = range.start;
        if let Some(pos) = arena.as_slice()[range]
            .iter()
            .position(|&b| b != self.fill_byte)
        {
            let offset = start + pos;
            self.raise(&Fault::BufferCorruption {
                offset,
                expected: self.fill_byte,
                found: arena.as_slice()[offset],
            });
        }
    }

    /// Returns false for an alignment that is not a power of two.
    ///
    /// With guards on the bad request is reported as a fault instead.
    #[inline]
    pub(crate) fn check_alignment(&self, align: usize) -> bool {
        if is_power_of_two(align) {
            return true;
        }
        if self.enabled {
            self.raise(&Fault::InvalidAlignment { align });
        }
        false
    }

    #[cold]
    pub(crate) fn raise(&self, fault: &Fault) -> ! {
        self.faults.raise(self.source, fault)
    }
}
