//! # Arena
//!
//! A contiguous, aligned byte range owned by exactly one allocator.
//!
//! The arena is the only place where kiln touches raw memory: it reserves a
//! block from a [`Backing`] provider, initializes every byte, and from then
//! on exposes it as bounds-checked slices. Allocators store their intrusive
//! links as offsets inside those slices, never as pointers.

#![allow(unsafe_code)]

use std::alloc::{handle_alloc_error, Layout};
use std::ops::Range;
use std::ptr::NonNull;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::alignment::{is_power_of_two, WORD};
use crate::memory::backing::Backing;

/// Sentinel offset marking the end of an intrusive list.
pub const NIL: usize = usize::MAX;

/// An owned, initialized byte range `[base, base + capacity)`.
///
/// # Thread Safety
///
/// The arena is `Send` and `Sync`; shared access only ever yields shared
/// slices. Writers need `&mut Arena` except through
/// [`slice_mut_unchecked`](Self::slice_mut_unchecked), whose caller
/// guarantees disjointness.
pub struct Arena {
    /// First byte of the reservation.
    base: NonNull<u8>,
    /// Layout passed to the backing provider.
    layout: Layout,
    /// Where the bytes came from and must go back to.
    backing: Backing,
}

// SAFETY: the arena exclusively owns its reservation; access goes through
// `&self`/`&mut self` like any owned buffer.
unsafe impl Send for Arena {}
// SAFETY: `&Arena` only hands out shared slices (or, through the unsafe
// accessor, slices the caller proved disjoint).
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserves `capacity` bytes aligned to `alignment` and fills them with
    /// `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidAlignment`] for a non power-of-two
    /// alignment, [`MemoryError::CapacityTooSmall`] for a zero capacity, and
    /// [`MemoryError::CapacityOverflow`] if the layout cannot be formed.
    ///
    /// A provider that cannot satisfy the reservation is fatal: the process
    /// is terminated through [`handle_alloc_error`].
    ///
    /// # Panics
    ///
    /// Panics if the provider returns a block that is not aligned to
    /// `alignment`. The block is released first.
    pub fn reserve(
        capacity: usize,
        alignment: usize,
        fill: u8,
        backing: &Backing,
    ) -> MemoryResult<Self> {
        if !is_power_of_two(alignment) {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        if capacity == 0 {
            return Err(MemoryError::CapacityTooSmall {
                requested: 0,
                minimum: 1,
            });
        }
        let layout = Layout::from_size_align(capacity, alignment)
            .map_err(|_| MemoryError::CapacityOverflow(capacity))?;

        let Some(base) = backing.reserve(layout) else {
            tracing::error!(
                capacity,
                alignment,
                provider = backing.name(),
                "arena reservation failed"
            );
            handle_alloc_error(layout);
        };
        if base.as_ptr() as usize & (alignment - 1) != 0 {
            // SAFETY: `base` came from `backing.reserve(layout)` and is not
            // used again.
            unsafe { backing.release(base, layout) };
            panic!(
                "backing provider `{}` returned a block misaligned for {alignment}",
                backing.name()
            );
        }

        // SAFETY: the provider returned `capacity` writable bytes at `base`.
        unsafe { std::ptr::write_bytes(base.as_ptr(), fill, capacity) };

        tracing::debug!(
            capacity,
            alignment,
            provider = backing.name(),
            "arena reserved"
        );

        Ok(Self {
            base,
            layout,
            backing: backing.clone(),
        })
    }

    /// Total size in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Alignment of the base address.
    #[inline]
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Address of the first byte.
    #[inline]
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset > capacity`.
    #[inline]
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.capacity(), "offset {offset} outside arena");
        // SAFETY: in bounds (one-past-the-end included) of the reservation,
        // and an in-bounds offset from a non-null pointer is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// The whole arena as a shared slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `capacity` bytes were initialized in `reserve`.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.capacity()) }
    }

    /// The whole arena as a mutable slice.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `capacity` bytes were initialized in `reserve`; `&mut self`
        // guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.capacity()) }
    }

    /// Mutable view of `range` obtained through a shared reference.
    ///
    /// # Panics
    ///
    /// Panics if `range` is inverted or extends past the arena.
    ///
    /// # Safety
    ///
    /// No other live reference (shared or mutable) may overlap `range` for
    /// the lifetime of the returned slice.
    #[inline]
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut_unchecked(&self, range: Range<usize>) -> &mut [u8] {
        assert!(
            range.start <= range.end && range.end <= self.capacity(),
            "range {range:?} outside arena"
        );
        std::slice::from_raw_parts_mut(self.base.as_ptr().add(range.start), range.len())
    }

    /// Fills `range` with `byte`.
    #[inline]
    pub fn fill(&mut self, range: Range<usize>, byte: u8) {
        self.as_mut_slice()[range].fill(byte);
    }

    /// Reads the native-endian word stored at `offset`.
    #[inline]
    #[must_use]
    pub fn read_word(&self, offset: usize) -> usize {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.as_slice()[offset..offset + WORD]);
        usize::from_ne_bytes(word)
    }

    /// Writes `value` as a native-endian word at `offset`.
    #[inline]
    pub fn write_word(&mut self, offset: usize, value: usize) {
        self.as_mut_slice()[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        tracing::debug!(
            capacity = self.capacity(),
            provider = self.backing.name(),
            "arena released"
        );
        // SAFETY: `base` came from `backing.reserve(layout)` and is released
        // exactly once, here.
        unsafe { self.backing.release(self.base, self.layout) };
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("alignment", &self.alignment())
            .field("backing", &self.backing)
            .finish()
    }
}
