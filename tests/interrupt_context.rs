// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! An interrupt that touches the heap trips the trap, and the heap survives.

use heapshare::{
    arena::Arena,
    test_util::{self, ArenaStorage, FreeListDelegate, ThreadRegion},
    Fault, Heap, HeapOptions, Reent,
};

#[test]
fn interrupts_cannot_allocate() {
    let storage = ArenaStorage::<512>::new();
    let heap = Heap::new(
        ThreadRegion::new(),
        FreeListDelegate::new(),
        Arena::new(storage.region()),
        HeapOptions::new().with_trap(test_util::panic_trap),
    );
    let kept = heap.allocate(32);
    assert!(!kept.is_null());
    let before = heap.arena_info();

    heap.port().set_inside_interrupt(true);
    assert_eq!(
        test_util::catch_fault(|| heap.allocate(16)),
        Err(Fault::IsrViolation)
    );
    assert_eq!(
        test_util::catch_fault(|| heap.grow(&mut Reent::new(), 16)),
        Err(Fault::IsrViolation)
    );
    assert_eq!(
        test_util::catch_fault(|| heap.env_lock()),
        Err(Fault::IsrViolation)
    );
    assert_eq!(
        test_util::catch_fault(|| heap.free_heap_size()),
        Err(Fault::IsrViolation)
    );

    // Back in a task, everything still works.
    heap.port().set_inside_interrupt(false);
    assert_eq!(heap.arena_info(), before);
    let block = heap.allocate(16);
    assert!(!block.is_null());
    assert_eq!(block, before.current);

    // Other threads aren't locked out by the faults.
    std::thread::scope(|scope| {
        scope.spawn(|| {
            heap.with_malloc_lock(|| ());
        });
    });
}
