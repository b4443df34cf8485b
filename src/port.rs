// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Capabilities that a heap borrows from the RTOS port.
//!
//! A heap never talks to a scheduler directly. Instead, it asks its port for
//! two things:
//!
//! - an [`ExclusiveRegion`], a nesting-safe critical section that's free of
//!   task preemption. On FreeRTOS, that's `vTaskSuspendAll` / `xTaskResumeAll`.
//! - an [`InterruptProbe`], which answers "is the processor servicing an
//!   interrupt right now?" On Cortex-M, that's a look at the active vector.
//!
//! Tests substitute a simulated scheduler, or a reentrant lock, for the real
//! thing. See the `test_util` module.

/// A fatal usage violation.
///
/// Faults are never returned to the caller. They're handed to the heap's
/// trap function (see [`HeapOptions::trap`](crate::HeapOptions::trap)),
/// which must not return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// A growth request, or a lock, was attempted from an interrupt.
    ///
    /// Interrupts cannot meaningfully suspend a task scheduler.
    IsrViolation,
    /// The arena is exhausted, and the heap halts on exhaustion.
    OutOfMemory,
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IsrViolation => f.write_str("heap accessed from an interrupt"),
            Self::OutOfMemory => f.write_str("heap arena exhausted"),
        }
    }
}

/// A critical section that's free of task preemption.
///
/// `enter` and `exit` calls nest. Only the outermost `exit` may let other
/// tasks run again.
///
/// # Safety
///
/// Between an `enter` and its matching `exit`, no other task may enter the
/// region. The heap relies on this guarantee to mutate its arena through a
/// shared reference.
pub unsafe trait ExclusiveRegion {
    /// Enter the region, or deepen the nesting if the caller's already inside.
    ///
    /// This must be safe to call before the scheduler starts.
    fn enter(&self);

    /// Leave the region entered by the most recent `enter`.
    ///
    /// # Safety
    ///
    /// Each call must pair with a prior [`enter`](Self::enter) from the same
    /// task.
    unsafe fn exit(&self);
}

/// Detects interrupt context.
pub trait InterruptProbe {
    /// Returns `true` if the caller runs in an interrupt handler.
    fn is_inside_interrupt(&self) -> bool;
}

/// Holds an [`ExclusiveRegion`] until dropped.
///
/// If a caller needs to leave the region entered on purpose, it can
/// [`core::mem::forget`] the guard.
pub(crate) struct Exclusive<'r, R: ExclusiveRegion + ?Sized> {
    region: &'r R,
    _not_send_or_sync: crate::marker::NotSendOrSync,
}

impl<'r, R: ExclusiveRegion + ?Sized> Exclusive<'r, R> {
    pub(crate) fn enter(region: &'r R) -> Self {
        region.enter();
        Self {
            region,
            _not_send_or_sync: crate::marker::NotSendOrSync::mark(),
        }
    }
}

impl<R: ExclusiveRegion + ?Sized> Drop for Exclusive<'_, R> {
    fn drop(&mut self) {
        // Safety: the guard entered the region on construction, and this is
        // the only exit for that entry.
        unsafe { self.region.exit() }
    }
}

// Safety: a shared reference to a region is as exclusive as the region.
unsafe impl<R: ExclusiveRegion + ?Sized> ExclusiveRegion for &R {
    fn enter(&self) {
        R::enter(self);
    }
    unsafe fn exit(&self) {
        // Safety: the caller upholds the pairing contract.
        unsafe { R::exit(self) }
    }
}

impl<I: InterruptProbe + ?Sized> InterruptProbe for &I {
    fn is_inside_interrupt(&self) -> bool {
        I::is_inside_interrupt(self)
    }
}
