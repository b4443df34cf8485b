// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! A Rust global allocator that shares newlib's heap.
//!
//! Rust allocations go through the same [`Heap`] as `pvPortMalloc`, so
//! they come from the same arena as C allocations, and they show up in
//! `xPortGetFreeHeapSize`.
//!
//! The package registers the global allocator for only those targets
//! that require it.
//!
//! # Alignment
//!
//! newlib aligns every block to eight bytes. Layouts that need more
//! alignment fail; the allocator returns null.
//!
//! # Panics
//!
//! An interrupt that allocates or deallocates hits the heap's trap. On
//! bare-metal ARM, that's a breakpoint.

#![no_std]

use core::alloc::{GlobalAlloc, Layout};

use heapshare::{Delegate, ExclusiveRegion, Heap, InterruptProbe};

/// newlib's `MALLOC_ALIGNMENT`.
pub const MALLOC_ALIGNMENT: usize = 8;

#[cfg(all(target_arch = "arm", target_os = "none"))]
#[global_allocator]
static GLOBAL_ALLOCATOR: HeapAllocator<heapshare_freertos::FreeRtos, heapshare_freertos::Newlib> =
    HeapAllocator::new(&heapshare_freertos::HEAP);

/// Adapts a [`Heap`] to [`GlobalAlloc`].
pub struct HeapAllocator<P: 'static, D: 'static> {
    heap: &'static Heap<P, D>,
}

impl<P: 'static, D: 'static> HeapAllocator<P, D> {
    /// Allocate from `heap`.
    pub const fn new(heap: &'static Heap<P, D>) -> Self {
        Self { heap }
    }

    /// The heap behind this allocator.
    pub const fn heap(&self) -> &'static Heap<P, D> {
        self.heap
    }
}

// Safety: blocks come from the heap's delegate, which hands out distinct
// blocks aligned to MALLOC_ALIGNMENT. Stricter layouts are refused.
unsafe impl<P, D> GlobalAlloc for HeapAllocator<P, D>
where
    P: ExclusiveRegion + InterruptProbe + 'static,
    D: Delegate + 'static,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MALLOC_ALIGNMENT {
            return core::ptr::null_mut();
        }
        self.heap.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        // Safety: the caller promises that the block came from alloc.
        unsafe { self.heap.free(ptr) }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::alloc::{GlobalAlloc, Layout};
    use std::boxed::Box;

    use heapshare::{
        arena::Arena,
        test_util::{self, ArenaStorage, FreeListDelegate, ThreadRegion},
        Heap, HeapOptions,
    };

    use super::HeapAllocator;

    fn allocator() -> HeapAllocator<ThreadRegion, FreeListDelegate> {
        let storage: &'static ArenaStorage<512> = Box::leak(Box::new(ArenaStorage::new()));
        let heap = Box::leak(Box::new(Heap::new(
            ThreadRegion::new(),
            FreeListDelegate::new(),
            Arena::new(storage.region()),
            HeapOptions::new().with_trap(test_util::panic_trap),
        )));
        HeapAllocator::new(heap)
    }

    #[test]
    fn allocations_share_the_heap() {
        let allocator = allocator();
        let layout = Layout::from_size_align(24, 8).unwrap();

        // Safety: the layout has a non-zero size.
        let block = unsafe { allocator.alloc(layout) };
        assert!(!block.is_null());
        assert_eq!(block as usize % 8, 0);
        assert_eq!(allocator.heap().free_heap_size(), 512 - 24);

        // Safety: the block came from this allocator, with this layout.
        unsafe { allocator.dealloc(block, layout) };
        assert_eq!(allocator.heap().free_heap_size(), 512);
    }

    #[test]
    fn overaligned_layouts_fail() {
        let allocator = allocator();
        let layout = Layout::from_size_align(32, 16).unwrap();

        // Safety: the layout has a non-zero size.
        let block = unsafe { allocator.alloc(layout) };
        assert!(block.is_null());
        assert_eq!(allocator.heap().arena_info().remaining, 512);
    }
}
