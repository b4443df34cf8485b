// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The RTOS allocation API.
//!
//! FreeRTOS expects a heap implementation to provide `pvPortMalloc`,
//! `vPortFree`, `xPortGetFreeHeapSize`, and `vPortInitialiseBlocks`. A
//! [`Heap`] provides them by forwarding to its [`Delegate`] allocator. The
//! delegate owns the free lists; the heap owns the arena the delegate grows
//! into.
//!
//! There's no "minimum ever free" query. The delegate's free lists don't
//! track a low-water mark, so the heap can't offer one.

use crate::heap::{Heap, HeapServices};
use crate::port::{ExclusiveRegion, InterruptProbe};

/// An allocator that manages free lists over memory from a [`Heap`].
///
/// Each method receives the heap's services. A delegate uses them to take
/// the allocator lock, and to grow into the arena. A C allocator may reach
/// the same services through exported symbols, and ignore the parameter.
///
/// # Safety
///
/// `malloc` must return null, or a block of at least `size` bytes, aligned
/// to at least 8 bytes, that doesn't overlap any other live block. The block
/// must stay valid until it's passed to `free`.
///
/// A delegate must only obtain raw memory through
/// [`HeapServices::grow`]. `free_list_bytes` must not count bytes that
/// the arena still reports as remaining.
pub unsafe trait Delegate {
    /// Allocate `size` bytes.
    ///
    /// Returns null if the request can't be satisfied.
    fn malloc(&self, services: &dyn HeapServices, size: usize) -> *mut u8;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `block` must be null, or a live block that this delegate returned
    /// from `malloc`.
    unsafe fn free(&self, services: &dyn HeapServices, block: *mut u8);

    /// The bytes that sit in the delegate's free lists, ready for reuse.
    fn free_list_bytes(&self, services: &dyn HeapServices) -> usize;
}

impl<P, D> Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe,
    D: Delegate,
{
    /// Allocate `size` bytes from the delegate.
    ///
    /// Returns the delegate's result, unchanged. That's null when the
    /// delegate can't find the memory.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        #[cfg(feature = "diagnostics")]
        {
            self.diagnostics
                .wrap_malloc(size, || self.delegate.malloc(self, size))
        }
        #[cfg(not(feature = "diagnostics"))]
        {
            self.delegate.malloc(self, size)
        }
    }

    /// Return a block to the delegate.
    ///
    /// Freeing null does nothing.
    ///
    /// # Safety
    ///
    /// `block` must be null, or a live block returned by
    /// [`allocate`](Self::allocate) on this heap. Double frees aren't
    /// detected.
    pub unsafe fn free(&self, block: *mut u8) {
        if block.is_null() {
            return;
        }
        // Safety: the caller promises that the block is live, and ours.
        unsafe { self.delegate.free(self, block) }
    }

    /// The bytes available for allocation.
    ///
    /// That's the memory in the delegate's free lists, plus the arena
    /// memory that the delegate hasn't yet taken. Both are read under one
    /// allocator lock, so no growth lands between the two reads.
    pub fn free_heap_size(&self) -> usize {
        self.with_malloc_lock(|| {
            let free_lists = self.delegate.free_list_bytes(self);
            let remaining = self.with_arena(crate::arena::Arena::remaining);
            free_lists.saturating_add(usize::try_from(remaining).unwrap_or(0))
        })
    }

    /// Prepare the heap for use.
    ///
    /// This does nothing. The arena resolves its bounds on first use, and
    /// the delegate initializes itself.
    #[inline]
    pub fn initialize_blocks(&self) {}
}
