// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Arbitrary growth sequences keep the arena's books balanced.

use heapshare::{
    arena::{Arena, Region},
    test_util::{self, ArenaStorage, FreeListDelegate, SimulatedScheduler},
    Heap, HeapOptions, Reent, ENOMEM,
};
use proptest::{collection::vec, proptest};

const CAPACITY: usize = 4096;

fn heap(storage: &ArenaStorage<CAPACITY>) -> Heap<SimulatedScheduler, FreeListDelegate> {
    Heap::new(
        SimulatedScheduler::new(),
        FreeListDelegate::new(),
        Arena::new(storage.region()),
        HeapOptions::new().with_trap(test_util::panic_trap),
    )
}

proptest! {
    #[test]
    fn cursor_tracks_the_running_sum(increments in vec(0isize..700, 0..32)) {
        let mut storage = vec![0u8; CAPACITY];
        let base = storage.as_mut_ptr();
        let mut arena = Arena::new(Region::from_slice(&mut storage));

        let mut sum = 0usize;
        for increment in increments {
            let before = arena.info();
            let fits = sum + increment.unsigned_abs() <= CAPACITY;

            match arena.grow(increment) {
                Ok(block) => {
                    assert!(fits);
                    assert_eq!(block, base.wrapping_add(sum));
                    sum += increment.unsigned_abs();
                }
                Err(exhausted) => {
                    assert!(!fits);
                    assert_eq!(exhausted.increment, increment);
                    assert_eq!(arena.info(), before);
                }
            }

            let info = arena.info();
            assert_eq!(info.current, base.wrapping_add(sum));
            assert_eq!(
                info.remaining.unsigned_abs(),
                info.limit as usize - info.current as usize
            );
        }
    }

    #[test]
    fn shrinking_never_passes_the_base(
        grow in 0isize..4096,
        shrinks in vec(-512isize..=0, 0..16),
    ) {
        let mut storage = vec![0u8; CAPACITY];
        let base = storage.as_mut_ptr();
        let mut arena = Arena::new(Region::from_slice(&mut storage));
        arena.grow(grow).unwrap();

        let mut used = grow;
        for shrink in shrinks {
            let result = arena.grow(shrink);
            assert_eq!(result.is_ok(), used + shrink >= 0);
            if result.is_ok() {
                used += shrink;
            }
            assert!(arena.info().current >= base);
            assert_eq!(arena.info().current, base.wrapping_offset(used));
        }
    }

    #[test]
    fn free_size_covers_the_arena(sizes in vec(1usize..300, 0..40), frees in vec(proptest::bool::ANY, 0..40)) {
        let storage = ArenaStorage::<CAPACITY>::new();
        let heap = heap(&storage);

        let mut live = Vec::new();
        for (size, free) in sizes.into_iter().zip(frees.into_iter().chain(core::iter::repeat(false))) {
            let block = heap.allocate(size);
            if block.is_null() {
                assert_eq!(heap.delegate().last_errno(), ENOMEM);
            } else {
                live.push(block);
            }
            if free {
                if let Some(block) = live.pop() {
                    // Safety: the block is live, and it's from this heap.
                    unsafe { heap.free(block) };
                }
            }

            let remaining = heap.arena_info().remaining;
            assert!(remaining >= 0);
            assert!(heap.free_heap_size() >= remaining.unsigned_abs());
            assert_eq!(heap.port().depth(), 0);
        }
    }
}

#[test]
fn four_kilobyte_walkthrough() {
    let storage = ArenaStorage::<CAPACITY>::new();
    let heap = heap(&storage);
    let mut reent = Reent::new();

    let base = heap.grow(&mut reent, 1024).unwrap();
    assert_eq!(heap.arena_info().remaining, 3072);

    assert!(heap.grow(&mut reent, 3200).is_err());
    assert_eq!(heap.arena_info().current, base.wrapping_add(1024));
    assert_eq!(reent.take_errno(), ENOMEM);

    heap.grow(&mut reent, 3072).unwrap();
    assert_eq!(heap.arena_info().remaining, 0);

    assert_eq!(heap.sbrk_r(&mut reent, 1), heapshare::SBRK_FAILED);
    assert_eq!(reent.errno(), ENOMEM);
}
