// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The runtime library's locks.
//!
//! newlib asks for two locks: one around its allocator's global state,
//! and one around the environment store (`getenv`, `setenv`). Both are
//! implemented by entering the port's exclusive region. There's no ordering
//! between the two; they nest like any other region entry.
//!
//! Locking from an interrupt is a fault.
//!
//! Prefer the scoped forms, [`Heap::with_malloc_lock`] and
//! [`Heap::with_env_lock`]. The raw unlock functions are `unsafe`, since each
//! unlock must pair with an earlier lock.

use crate::heap::Heap;
use crate::port::{Exclusive, ExclusiveRegion, InterruptProbe};

impl<P, D> Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe,
{
    fn lock(&self) {
        self.forbid_interrupts();
        self.port.enter();
    }

    /// Take the allocator lock.
    pub fn malloc_lock(&self) {
        self.lock();
    }

    /// Release the allocator lock.
    ///
    /// # Safety
    ///
    /// Each call must pair with a prior [`malloc_lock`](Self::malloc_lock)
    /// from the same task.
    pub unsafe fn malloc_unlock(&self) {
        // Safety: the caller pairs this unlock with a lock.
        unsafe { self.port.exit() }
    }

    /// Take the environment lock.
    pub fn env_lock(&self) {
        self.lock();
    }

    /// Release the environment lock.
    ///
    /// # Safety
    ///
    /// Each call must pair with a prior [`env_lock`](Self::env_lock)
    /// from the same task.
    pub unsafe fn env_unlock(&self) {
        // Safety: the caller pairs this unlock with a lock.
        unsafe { self.port.exit() }
    }

    /// Run `f` while holding the allocator lock.
    pub fn with_malloc_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.forbid_interrupts();
        let _lock = Exclusive::enter(&self.port);
        f()
    }

    /// Run `f` while holding the environment lock.
    pub fn with_env_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.forbid_interrupts();
        let _lock = Exclusive::enter(&self.port);
        f()
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::Arena;
    use crate::port::Fault;
    use crate::test_util::{self, FreeListDelegate, SimulatedScheduler};
    use crate::{Heap, HeapOptions};

    fn heap() -> Heap<SimulatedScheduler, FreeListDelegate> {
        Heap::new(
            SimulatedScheduler::new(),
            FreeListDelegate::new(),
            Arena::default(),
            HeapOptions::new().with_trap(test_util::panic_trap),
        )
    }

    #[test]
    fn locks_nest_across_domains() {
        let heap = heap();

        heap.malloc_lock();
        heap.env_lock();
        heap.malloc_lock();
        assert_eq!(heap.port().depth(), 3);

        // Safety: each unlock pairs with a lock above.
        unsafe {
            heap.malloc_unlock();
            heap.env_unlock();
            assert_eq!(heap.port().depth(), 1);
            heap.malloc_unlock();
        }
        assert_eq!(heap.port().depth(), 0);
        assert_eq!(heap.port().max_depth(), 3);
    }

    #[test]
    fn scoped_locks_release_on_return() {
        let heap = heap();
        let answer = heap.with_env_lock(|| heap.with_malloc_lock(|| heap.port().depth()));
        assert_eq!(answer, 2);
        assert_eq!(heap.port().depth(), 0);
    }

    #[test]
    fn locking_in_an_interrupt_is_fatal() {
        let heap = heap();
        heap.port().set_inside_interrupt(true);

        assert_eq!(
            test_util::catch_fault(|| heap.malloc_lock()),
            Err(Fault::IsrViolation)
        );
        assert_eq!(
            test_util::catch_fault(|| heap.with_env_lock(|| ())),
            Err(Fault::IsrViolation)
        );
        assert_eq!(heap.port().entries(), 0);
    }
}
