// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! A critical section implementation for FreeRTOS tasks.
//!
//! This package provides a [`critical-section`](https://docs.rs/critical-section/1/critical_section/)
//! implementation that suspends the FreeRTOS scheduler. It's the same
//! mechanism that guards newlib's allocator in `heapshare-freertos`, so a
//! critical section can safely allocate.
//!
//! To use this critical section, depend on this package. Then, mention the
//! package somewhere in your dependency graph, with
//! `use heapshare_critical_section as _;`.
//!
//! # Panics
//!
//! The critical section panics if an interrupt tries to acquire it.
//!
//! ## On panicking in interrupts
//!
//! Scheduler suspension keeps other *tasks* away from shared state. It does
//! nothing about interrupts, which keep running while the scheduler is
//! suspended. If an interrupt could acquire this critical section, it would
//! believe it had exclusive access while a suspended task was mid-update.
//!
//! Interrupts also can't suspend the scheduler. Rather than hand out a
//! critical section that protects nothing, the implementation panics.
//!
//! A suspended scheduler means a task must not block inside the critical
//! section. Keep critical sections short.

#![no_std]

use critical_section::RawRestoreState;

use heapshare::{ExclusiveRegion, InterruptProbe};
use heapshare_freertos::FreeRtos;

struct FreeRtosCriticalSection;
critical_section::set_impl!(FreeRtosCriticalSection);

unsafe impl critical_section::Impl for FreeRtosCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        assert!(
            !FreeRtos.is_inside_interrupt(),
            "critical section acquired in an interrupt"
        );
        FreeRtos.enter();
    }

    unsafe fn release(_: RawRestoreState) {
        unsafe { FreeRtos.exit() }
    }
}
