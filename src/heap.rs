// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The heap, its options, and the services it offers a delegate allocator.

use core::cell::UnsafeCell;

use crate::arena::{Arena, ArenaInfo, Exhausted};
use crate::facade::Delegate;
use crate::port::{Exclusive, ExclusiveRegion, Fault, InterruptProbe};
use crate::reent::Reent;

/// What to do when the arena can't satisfy a growth request.
///
/// A heap applies exactly one policy, chosen when the heap is constructed.
#[derive(Debug, Clone, Copy)]
pub enum OomPolicy {
    /// Call an application hook.
    ///
    /// The hook runs inside the exclusive region, and the heap never leaves
    /// that region. The hook should recover, or halt the system. If it
    /// returns, the growth request fails and the scheduler stays suspended.
    Hook(fn(Exhausted)),
    /// Hand [`Fault::OutOfMemory`] to the heap's trap function.
    ///
    /// Use this while debugging.
    Halt,
    /// Record `ENOMEM` in the caller's reentrancy context, and fail the
    /// request.
    ///
    /// The delegate allocator then returns null to the application.
    Errno,
}

/// Options for a [`Heap`].
///
/// Use `Default` to get the defaults, then modify the options
/// you care about.
///
/// ```
/// use heapshare::{HeapOptions, OomPolicy};
///
/// let mut opts = HeapOptions::default();
/// opts.oom = OomPolicy::Halt;
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct HeapOptions {
    /// The out-of-memory policy.
    ///
    /// By default, the heap records `ENOMEM`.
    pub oom: OomPolicy,
    /// Receives fatal faults. It must not return.
    ///
    /// By default, this aborts the program. A bare-metal port usually
    /// supplies a function that stops at a breakpoint.
    pub trap: fn(Fault) -> !,
}

impl HeapOptions {
    /// The default options, usable in a `const` context.
    pub const fn new() -> Self {
        Self {
            oom: OomPolicy::Errno,
            trap: crate::panic::halt,
        }
    }

    /// Use a different out-of-memory policy.
    #[must_use]
    pub const fn with_oom(mut self, oom: OomPolicy) -> Self {
        self.oom = oom;
        self
    }

    /// Use a different trap function.
    #[must_use]
    pub const fn with_trap(mut self, trap: fn(Fault) -> !) -> Self {
        self.trap = trap;
        self
    }
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The services a heap provides to its delegate allocator.
///
/// newlib reaches these services through `_sbrk_r` and `__malloc_lock`.
/// A delegate written in Rust calls them directly.
pub trait HeapServices {
    /// Ask for more raw memory.
    ///
    /// See [`Heap::grow`].
    fn grow(&self, reent: &mut Reent, increment: isize) -> Result<*mut u8, Exhausted>;

    /// Take the allocator lock.
    fn malloc_lock(&self);

    /// Release the allocator lock.
    ///
    /// # Safety
    ///
    /// Each call must pair with a prior [`malloc_lock`](Self::malloc_lock)
    /// from the same task.
    unsafe fn malloc_unlock(&self);
}

/// A memory arena shared between an RTOS and a delegate allocator.
///
/// `P` is the port, which supplies scheduler suspension and interrupt
/// detection. `D` is the delegate allocator, which manages free lists over
/// the memory that the heap provides.
///
/// The heap's operations are spread across modules:
///
/// - [`growth`](crate::growth): the reentrant growth function.
/// - [`lock`](crate::lock): the allocator and environment locks.
/// - [`facade`](crate::facade): allocate, free, and query free bytes.
pub struct Heap<P, D> {
    pub(crate) arena: UnsafeCell<Arena>,
    pub(crate) port: P,
    pub(crate) delegate: D,
    pub(crate) options: HeapOptions,
    #[cfg(feature = "diagnostics")]
    pub(crate) diagnostics: crate::diagnostics::Diagnostics,
}

impl<P, D> Heap<P, D> {
    /// Create a heap.
    ///
    /// This is `const`, so that a port can place its heap in a `static`.
    /// Pair it with [`Arena::deferred`] when the arena's bounds come from
    /// the linker.
    pub const fn new(port: P, delegate: D, arena: Arena, options: HeapOptions) -> Self {
        Self {
            arena: UnsafeCell::new(arena),
            port,
            delegate,
            options,
            #[cfg(feature = "diagnostics")]
            diagnostics: crate::diagnostics::Diagnostics::new(),
        }
    }

    /// The port.
    #[inline]
    pub const fn port(&self) -> &P {
        &self.port
    }

    /// The delegate allocator.
    #[inline]
    pub const fn delegate(&self) -> &D {
        &self.delegate
    }

    /// The options the heap was created with.
    #[inline]
    pub const fn options(&self) -> &HeapOptions {
        &self.options
    }

    /// The allocation counters.
    #[cfg(feature = "diagnostics")]
    #[inline]
    pub const fn diagnostics(&self) -> &crate::diagnostics::Diagnostics {
        &self.diagnostics
    }
}

impl<P, D> Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe,
{
    /// Trap if the caller is an interrupt.
    pub(crate) fn forbid_interrupts(&self) {
        if self.port.is_inside_interrupt() {
            log!(error, "heap accessed from an interrupt");
            (self.options.trap)(Fault::IsrViolation);
        }
    }

    /// Run `f` on the arena inside the exclusive region.
    pub(crate) fn with_arena<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        self.forbid_interrupts();
        let _region = Exclusive::enter(&self.port);
        // Safety: the exclusive region keeps every other task away from the
        // arena. Nothing in this task borrows the arena across calls.
        f(unsafe { &mut *self.arena.get() })
    }

    /// Take a snapshot of the arena.
    ///
    /// If the arena's bounds are deferred, this resolves them.
    pub fn arena_info(&self) -> ArenaInfo {
        self.with_arena(Arena::info)
    }
}

impl<P, D> HeapServices for Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe,
    D: Delegate,
{
    fn grow(&self, reent: &mut Reent, increment: isize) -> Result<*mut u8, Exhausted> {
        Heap::grow(self, reent, increment)
    }

    fn malloc_lock(&self) {
        Heap::malloc_lock(self);
    }

    unsafe fn malloc_unlock(&self) {
        // Safety: the caller pairs this with a prior lock.
        unsafe { Heap::malloc_unlock(self) }
    }
}

impl<P: core::fmt::Debug, D: core::fmt::Debug> core::fmt::Debug for Heap<P, D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // The arena is left out. Reading it requires the exclusive region.
        f.debug_struct("Heap")
            .field("port", &self.port)
            .field("delegate", &self.delegate)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// Safety: the port's exclusive region serializes every access to the arena.
// See the safety contract of ExclusiveRegion.
unsafe impl<P, D> Sync for Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe + Sync,
    D: Delegate + Sync,
{
}
