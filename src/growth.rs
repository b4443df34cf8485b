// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The reentrant growth function.
//!
//! A delegate allocator calls [`Heap::grow`] when its free lists can't
//! satisfy a request. This is the Rust side of newlib's `_sbrk_r`.
//!
//! # Locking
//!
//! Growth suspends the scheduler around its check-then-commit on the arena.
//! newlib already holds `__malloc_lock` when it calls `_sbrk_r`, so that
//! suspension usually nests inside another. Nesting is expected; the port's
//! exclusive region must support it.
//!
//! # Interrupts
//!
//! Growth never runs in an interrupt. If an interrupt asks for memory, the
//! heap hands [`Fault::IsrViolation`] to its trap function before it touches
//! the arena.

use core::ffi::c_void;

use crate::arena::Exhausted;
use crate::heap::{Heap, OomPolicy};
use crate::port::{Exclusive, ExclusiveRegion, Fault, InterruptProbe};
use crate::reent::{Reent, ENOMEM};

/// The C-ABI failure value of `sbrk`, `(void *)-1`.
pub const SBRK_FAILED: *mut c_void = usize::MAX as *mut c_void;

impl<P, D> Heap<P, D>
where
    P: ExclusiveRegion + InterruptProbe,
{
    /// Move the arena's cursor by `increment` bytes.
    ///
    /// On success, returns the start of the new block. That's the cursor's
    /// position before the move.
    ///
    /// If the arena can't satisfy the request, the heap applies its
    /// [`OomPolicy`], and the arena is left as it was:
    ///
    /// - [`OomPolicy::Hook`] calls the hook while the scheduler is still
    ///   suspended, and never resumes the scheduler. If the hook returns,
    ///   this returns the error.
    /// - [`OomPolicy::Halt`] traps. This doesn't return.
    /// - [`OomPolicy::Errno`] writes `ENOMEM` into `reent`, resumes the
    ///   scheduler, and returns the error.
    ///
    /// If the caller is an interrupt, the heap traps with
    /// [`Fault::IsrViolation`].
    pub fn grow(&self, reent: &mut Reent, increment: isize) -> Result<*mut u8, Exhausted> {
        self.forbid_interrupts();

        let region = Exclusive::enter(&self.port);
        // Safety: the exclusive region keeps every other task away from the
        // arena, and this borrow ends before anything else runs.
        let result = unsafe { (*self.arena.get()).grow(increment) };

        match result {
            Ok(block) => {
                #[cfg(feature = "diagnostics")]
                self.diagnostics.record_growth(increment);
                drop(region);
                log!(trace, "heap grew by {=isize} at {=usize:#x}", increment, block as usize);
                Ok(block)
            }
            Err(exhausted) => {
                log!(
                    warn,
                    "heap exhausted: wanted {=isize}, {=isize} remain",
                    exhausted.increment,
                    exhausted.remaining
                );
                match self.options.oom {
                    OomPolicy::Hook(hook) => {
                        core::mem::forget(region);
                        hook(exhausted);
                    }
                    OomPolicy::Halt => (self.options.trap)(Fault::OutOfMemory),
                    OomPolicy::Errno => {
                        reent.set_errno(ENOMEM);
                        drop(region);
                    }
                }
                Err(exhausted)
            }
        }
    }

    /// [`grow`](Self::grow), with newlib's calling convention.
    ///
    /// Returns the new block as a raw pointer, or [`SBRK_FAILED`] if the
    /// arena refused the request.
    pub fn sbrk_r(&self, reent: &mut Reent, increment: isize) -> *mut c_void {
        self.grow(reent, increment)
            .map_or(SBRK_FAILED, <*mut u8>::cast)
    }

    /// [`sbrk_r`](Self::sbrk_r), for a context pointer from C.
    ///
    /// `reent` may be null. The error code then lands in a scratch context
    /// that the caller never sees.
    ///
    /// # Safety
    ///
    /// `reent` must be null, or point to a valid context that nothing else
    /// borrows during the call.
    pub unsafe fn sbrk_r_raw(&self, reent: *mut Reent, increment: isize) -> *mut c_void {
        let mut scratch = Reent::new();
        // Safety: the caller promises that a non-null reent is valid.
        let reent = unsafe { reent.as_mut() }.unwrap_or(&mut scratch);
        self.sbrk_r(reent, increment)
    }
}
