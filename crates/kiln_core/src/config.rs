//! # Allocator Configuration
//!
//! Construction-time settings shared by every arena-backed allocator.
//! The serializable part (alignment, guard settings) can be loaded once at
//! startup from a TOML file:
//!
//! ```toml
//! alignment = 64
//!
//! [guards]
//! enabled = true
//! fill_byte = 0xCD
//! ```
//!
//! The backing provider and the fault handler are runtime capabilities and
//! are attached with the builder methods.

use serde::{Deserialize, Serialize};

use crate::diagnostics::{FaultHandler, FaultSink};
use crate::error::{MemoryError, MemoryResult};
use crate::memory::alignment::is_power_of_two;
use crate::memory::{Backing, BackingAllocator};

/// Debug guard settings.
///
/// When enabled, allocators fill unused and freed memory with `fill_byte`,
/// stamp `signature` next to live blocks, and verify both on the next
/// guarded operation. Enabling guards changes timing and footprint, never
/// the allocation algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    /// Whether guard bytes and signatures are written and checked.
    pub enabled: bool,
    /// Byte pattern written over unused and freed memory.
    pub fill_byte: u8,
    /// Signature word stamped before live blocks.
    pub signature: u64,
}

impl GuardConfig {
    /// Default fill pattern.
    pub const DEFAULT_FILL_BYTE: u8 = 0xCD;

    /// Default block signature.
    pub const DEFAULT_SIGNATURE: u64 = 0x5AFE_B10C_4B49_4C4E;

    /// Guards switched on.
    #[must_use]
    pub const fn enabled() -> Self {
        Self {
            enabled: true,
            fill_byte: Self::DEFAULT_FILL_BYTE,
            signature: Self::DEFAULT_SIGNATURE,
        }
    }

    /// Guards switched off.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            fill_byte: Self::DEFAULT_FILL_BYTE,
            signature: Self::DEFAULT_SIGNATURE,
        }
    }
}

impl Default for GuardConfig {
    /// Guards follow the build: on with debug assertions, off otherwise.
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::enabled()
        } else {
            Self::disabled()
        }
    }
}

/// Configuration for an arena-backed allocator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Alignment of the arena base address (power of two).
    pub alignment: usize,
    /// Debug guard settings.
    pub guards: GuardConfig,
    /// Provider the arena is reserved from.
    #[serde(skip)]
    pub backing: Backing,
    /// Receiver for faults detected by guards.
    #[serde(skip)]
    pub faults: FaultSink,
}

impl AllocatorConfig {
    /// Default arena alignment: one cache line.
    pub const DEFAULT_ALIGNMENT: usize = 64;

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if the document does not parse
    /// and [`MemoryError::InvalidAlignment`] if the alignment is invalid.
    pub fn from_toml_str(source: &str) -> MemoryResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| MemoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> MemoryResult<String> {
        toml::to_string(self).map_err(|e| MemoryError::InvalidConfig(e.to_string()))
    }

    /// Checks that the configuration can be used to build an arena.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidAlignment`] if `alignment` is not a
    /// power of two.
    pub fn validate(&self) -> MemoryResult<()> {
        if !is_power_of_two(self.alignment) {
            return Err(MemoryError::InvalidAlignment(self.alignment));
        }
        Ok(())
    }

    /// Returns a copy with guards switched on or off.
    #[must_use]
    pub fn with_guards(mut self, enabled: bool) -> Self {
        self.guards.enabled = enabled;
        self
    }

    /// Returns a copy with a different arena alignment.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Returns a copy that reserves its arena from `provider`.
    #[must_use]
    pub fn with_backing(mut self, provider: impl BackingAllocator + 'static) -> Self {
        self.backing = Backing::new(provider);
        self
    }

    /// Returns a copy that reports faults to `handler`.
    #[must_use]
    pub fn with_fault_handler(mut self, handler: impl FaultHandler + 'static) -> Self {
        self.faults = FaultSink::new(handler);
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            alignment: Self::DEFAULT_ALIGNMENT,
            guards: GuardConfig::default(),
            backing: Backing::default(),
            faults: FaultSink::default(),
        }
    }
}
