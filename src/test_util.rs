// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Host-side stand-ins for an RTOS and a C allocator.
//!
//! Enable the `test-utils` feature to use these in your own tests.

use core::cell::{Cell, UnsafeCell};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::vec::Vec;

use crate::arena::Region;
use crate::facade::Delegate;
use crate::heap::HeapServices;
use crate::port::{ExclusiveRegion, Fault, InterruptProbe};
use crate::reent::Reent;

/// A single-task scheduler that records how deep its suspensions go.
///
/// It's not `Sync`. Use [`ThreadRegion`] to share a heap across threads.
#[derive(Debug, Default)]
pub struct SimulatedScheduler {
    depth: Cell<usize>,
    max_depth: Cell<usize>,
    entries: Cell<usize>,
    inside_interrupt: Cell<bool>,
}

impl SimulatedScheduler {
    /// A running scheduler, outside of any interrupt.
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
            max_depth: Cell::new(0),
            entries: Cell::new(0),
            inside_interrupt: Cell::new(false),
        }
    }

    /// The current suspension depth. Zero means the scheduler's running.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// The deepest suspension seen so far.
    pub fn max_depth(&self) -> usize {
        self.max_depth.get()
    }

    /// How many times the scheduler was suspended.
    pub fn entries(&self) -> usize {
        self.entries.get()
    }

    /// Pretend that the caller is, or isn't, an interrupt handler.
    pub fn set_inside_interrupt(&self, inside: bool) {
        self.inside_interrupt.set(inside);
    }
}

// Safety: there's only one task, and it owns the scheduler.
unsafe impl ExclusiveRegion for SimulatedScheduler {
    fn enter(&self) {
        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        self.max_depth.set(self.max_depth.get().max(depth));
        self.entries.set(self.entries.get() + 1);
    }

    unsafe fn exit(&self) {
        let depth = self.depth.get();
        assert!(depth > 0, "resumed a scheduler that wasn't suspended");
        self.depth.set(depth - 1);
    }
}

impl InterruptProbe for SimulatedScheduler {
    fn is_inside_interrupt(&self) -> bool {
        self.inside_interrupt.get()
    }
}

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// A reentrant lock that stands in for scheduler suspension.
///
/// Each thread acts as a task. While one thread holds the region, the
/// others block in `enter`.
#[derive(Debug, Default)]
pub struct ThreadRegion {
    owner: Mutex<Owner>,
    released: Condvar,
    inside_interrupt: AtomicBool,
}

impl ThreadRegion {
    /// An unlocked region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend that every caller is, or isn't, an interrupt handler.
    pub fn set_inside_interrupt(&self, inside: bool) {
        self.inside_interrupt.store(inside, Ordering::Relaxed);
    }

    fn owner(&self) -> MutexGuard<'_, Owner> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Safety: a thread only enters once no other thread owns the region.
unsafe impl ExclusiveRegion for ThreadRegion {
    fn enter(&self) {
        let me = thread::current().id();
        let mut owner = self.owner();
        while owner.thread.is_some_and(|thread| thread != me) {
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        owner.thread = Some(me);
        owner.depth += 1;
    }

    unsafe fn exit(&self) {
        let mut owner = self.owner();
        assert_eq!(
            owner.thread,
            Some(thread::current().id()),
            "left a region this thread didn't enter"
        );
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            self.released.notify_one();
        }
    }
}

impl InterruptProbe for ThreadRegion {
    fn is_inside_interrupt(&self) -> bool {
        self.inside_interrupt.load(Ordering::Relaxed)
    }
}

/// The block granularity of [`FreeListDelegate`].
pub const FREE_LIST_ALIGN: usize = 8;

#[derive(Debug, Default)]
struct FreeLists {
    free: Vec<(usize, usize)>,
    live: BTreeMap<usize, usize>,
    reent: Reent,
}

/// A first-fit allocator that grows through the heap.
///
/// It behaves like newlib's allocator as far as the heap can tell. It takes
/// the allocator lock around its work, and asks for raw memory only when no
/// free block fits. Blocks are never split or merged.
#[derive(Debug, Default)]
pub struct FreeListDelegate {
    lists: Mutex<FreeLists>,
}

impl FreeListDelegate {
    /// An allocator with empty free lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// The error code that the heap most recently recorded for this
    /// allocator.
    pub fn last_errno(&self) -> core::ffi::c_int {
        self.lists().reent.errno()
    }

    /// The sizes of every live block, keyed by address.
    pub fn live_blocks(&self) -> BTreeMap<usize, usize> {
        self.lists().live.clone()
    }

    fn lists(&self) -> MutexGuard<'_, FreeLists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the allocator lock until dropped.
struct MallocLock<'s>(&'s dyn HeapServices);

impl<'s> MallocLock<'s> {
    fn take(services: &'s dyn HeapServices) -> Self {
        services.malloc_lock();
        Self(services)
    }
}

impl Drop for MallocLock<'_> {
    fn drop(&mut self) {
        // Safety: paired with the lock taken on construction.
        unsafe { self.0.malloc_unlock() }
    }
}

// Safety: blocks come from the arena, in multiples of eight bytes. The arena
// storage is aligned to sixteen. A block leaves the free list when it's
// handed out.
unsafe impl Delegate for FreeListDelegate {
    fn malloc(&self, services: &dyn HeapServices, size: usize) -> *mut u8 {
        let Some(size) = size
            .max(1)
            .checked_next_multiple_of(FREE_LIST_ALIGN)
            .and_then(|size| isize::try_from(size).ok())
        else {
            return core::ptr::null_mut();
        };

        let _lock = MallocLock::take(services);
        let mut lists = self.lists();

        let fit = lists
            .free
            .iter()
            .position(|&(_, free)| free >= size.unsigned_abs());
        if let Some(index) = fit {
            let (addr, free) = lists.free.swap_remove(index);
            lists.live.insert(addr, free);
            return addr as *mut u8;
        }

        let lists = &mut *lists;
        match services.grow(&mut lists.reent, size) {
            Ok(block) => {
                lists.live.insert(block as usize, size.unsigned_abs());
                block
            }
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn free(&self, services: &dyn HeapServices, block: *mut u8) {
        let _lock = MallocLock::take(services);
        let mut lists = self.lists();
        let size = lists
            .live
            .remove(&(block as usize))
            .unwrap_or_else(|| panic!("freed an unknown block {block:p}"));
        lists.free.push((block as usize, size));
    }

    fn free_list_bytes(&self, services: &dyn HeapServices) -> usize {
        let _lock = MallocLock::take(services);
        self.lists().free.iter().map(|&(_, size)| size).sum()
    }
}

/// A trap that panics with the [`Fault`] as its payload.
///
/// Pair it with [`catch_fault`].
pub fn panic_trap(fault: Fault) -> ! {
    std::panic::panic_any(fault)
}

/// Run `f`, and catch a fault raised by [`panic_trap`].
///
/// Other panics keep unwinding.
pub fn catch_fault<R>(f: impl FnOnce() -> R) -> Result<R, Fault> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(|payload| {
        match payload.downcast::<Fault>() {
            Ok(fault) => *fault,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    })
}

/// Memory for a test arena.
#[repr(C, align(16))]
pub struct ArenaStorage<const N: usize>(UnsafeCell<[u8; N]>);

impl<const N: usize> ArenaStorage<N> {
    /// Zeroed storage.
    pub const fn new() -> Self {
        Self(UnsafeCell::new([0; N]))
    }

    /// The first byte of storage.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }

    /// The region covering all of the storage.
    pub fn region(&self) -> Region {
        let base = self.as_mut_ptr();
        Region::new(base, base.wrapping_add(N))
    }
}

impl<const N: usize> Default for ArenaStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the storage is only reached through the raw pointers it hands out.
// Whoever holds those pointers synchronizes their use.
unsafe impl<const N: usize> Sync for ArenaStorage<N> {}
