//! # Backing Memory Providers
//!
//! Every arena gets its bytes from a [`BackingAllocator`] exactly once at
//! construction and hands them back exactly once on drop.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Low-level source of arena memory.
///
/// The process heap ([`SystemHeap`]) is the default. Engines that reserve
/// virtual memory up front or carve arenas out of a parent allocator plug
/// in their own implementation.
///
/// # Safety
///
/// A block returned by [`reserve`](Self::reserve) must be valid for reads
/// and writes of `layout.size()` bytes, start at a multiple of
/// `layout.align()`, and stay untouched by anyone else until it is passed
/// to [`release`](Self::release). Arenas write to it and hand out slices
/// over it without further checks.
pub unsafe trait BackingAllocator: Send + Sync {
    /// Reserves a block satisfying `layout`, or `None` if the provider is
    /// exhausted. `layout.size()` is never zero.
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block previously obtained from [`reserve`](Self::reserve).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `self.reserve(layout)` with the same `layout`
    /// and must not be released twice.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// Backing provider that forwards to the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHeap;

// SAFETY: the global allocator returns blocks that satisfy `layout`.
unsafe impl BackingAllocator for SystemHeap {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: arenas never request zero-sized layouts.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Shared, cloneable handle to a [`BackingAllocator`].
#[derive(Clone)]
pub struct Backing(Arc<dyn BackingAllocator>);

impl Backing {
    /// Wraps a provider.
    pub fn new(provider: impl BackingAllocator + 'static) -> Self {
        Self(Arc::new(provider))
    }

    /// Name of the wrapped provider.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub(crate) fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.0.reserve(layout)
    }

    /// # Safety
    ///
    /// Same contract as [`BackingAllocator::release`].
    pub(crate) unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.release(ptr, layout);
    }
}

impl Default for Backing {
    fn default() -> Self {
        Self::new(SystemHeap)
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backing").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_heap_round_trip() {
        let heap = SystemHeap;
        let layout = Layout::from_size_align(4096, 64).unwrap();
        let ptr = heap.reserve(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        unsafe { heap.release(ptr, layout) };
    }

    #[test]
    fn test_backing_debug_names_provider() {
        let backing = Backing::default();
        assert_eq!(format!("{backing:?}"), "Backing(\"system\")");
    }
}
