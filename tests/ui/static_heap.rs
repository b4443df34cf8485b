// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

use core::sync::atomic::{AtomicUsize, Ordering};

use heapshare::{
    arena::{Arena, Region},
    Delegate, ExclusiveRegion, Heap, HeapOptions, HeapServices, InterruptProbe, Reent,
};

/// A port for a program with one task, and no interrupts.
struct OneTask {
    depth: AtomicUsize,
}

// Safety: there's only one task.
unsafe impl ExclusiveRegion for OneTask {
    fn enter(&self) {
        self.depth.store(self.depth.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }
    unsafe fn exit(&self) {
        self.depth.store(self.depth.load(Ordering::Relaxed) - 1, Ordering::Relaxed);
    }
}

impl InterruptProbe for OneTask {
    fn is_inside_interrupt(&self) -> bool {
        false
    }
}

/// Never reuses memory.
struct Bump;

// Safety: every block is fresh from the arena, and sizes are rounded to
// eight bytes.
unsafe impl Delegate for Bump {
    fn malloc(&self, services: &dyn HeapServices, size: usize) -> *mut u8 {
        let size = (size + 7) & !7;
        services.malloc_lock();
        let block = services
            .grow(&mut Reent::new(), size as isize)
            .unwrap_or(core::ptr::null_mut());
        // Safety: paired with the lock above.
        unsafe { services.malloc_unlock() };
        block
    }
    unsafe fn free(&self, _: &dyn HeapServices, _: *mut u8) {}
    fn free_list_bytes(&self, _: &dyn HeapServices) -> usize {
        0
    }
}

#[repr(align(8))]
struct Storage([u8; 1024]);
static mut STORAGE: Storage = Storage([0; 1024]);

fn region() -> Region {
    let base = (&raw mut STORAGE).cast::<u8>();
    Region::new(base, base.wrapping_add(1024)).reserve_top(256)
}

static HEAP: Heap<OneTask, Bump> = Heap::new(
    OneTask {
        depth: AtomicUsize::new(0),
    },
    Bump,
    Arena::deferred(region),
    HeapOptions::new(),
);

fn main() {
    HEAP.initialize_blocks();
    assert_eq!(HEAP.free_heap_size(), 768);

    let first = HEAP.allocate(100);
    let second = HEAP.allocate(1);
    assert_eq!(second, first.wrapping_add(104));
    assert_eq!(HEAP.free_heap_size(), 768 - 112);

    assert!(HEAP.allocate(1024).is_null());
    assert_eq!(HEAP.port().depth.load(Ordering::Relaxed), 0);
}
