// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Allocation accounting.
//!
//! These counters help you find who requests memory, and how much. They're
//! advisory. Updates are plain loads and stores, so a preempted update may
//! lose a count. That keeps the counters usable on cores without atomic
//! read-modify-write instructions, like ARMv6-M.
//!
//! The flag that marks an outer `malloc` in progress is shared by every
//! task. If a task preempts another task's outer `malloc`, its own
//! `_malloc_r` calls aren't counted until that outer call returns.
//!
//! The counters only exist when the `diagnostics` feature is enabled.

use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// A snapshot of the allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiagnosticsInfo {
    /// How many times the allocate entry point ran.
    pub call_count: usize,
    /// The sum of all sizes passed to the allocate entry point.
    pub total_bytes_requested: usize,
    /// The net bytes that the growth function handed to the delegate.
    pub bytes_provided: isize,
}

/// Allocation counters.
#[derive(Debug)]
pub struct Diagnostics {
    call_count: AtomicUsize,
    total_bytes_requested: AtomicUsize,
    bytes_provided: AtomicIsize,
    inside_malloc: AtomicBool,
}

impl Diagnostics {
    pub(crate) const fn new() -> Self {
        Self {
            call_count: AtomicUsize::new(0),
            total_bytes_requested: AtomicUsize::new(0),
            bytes_provided: AtomicIsize::new(0),
            inside_malloc: AtomicBool::new(false),
        }
    }

    /// Take a snapshot of the counters.
    pub fn info(&self) -> DiagnosticsInfo {
        DiagnosticsInfo {
            call_count: self.call_count.load(Ordering::Relaxed),
            total_bytes_requested: self.total_bytes_requested.load(Ordering::Relaxed),
            bytes_provided: self.bytes_provided.load(Ordering::Relaxed),
        }
    }

    fn record_request(&self, nbytes: usize) {
        let calls = self.call_count.load(Ordering::Relaxed);
        self.call_count.store(calls.wrapping_add(1), Ordering::Relaxed);
        let total = self.total_bytes_requested.load(Ordering::Relaxed);
        self.total_bytes_requested
            .store(total.wrapping_add(nbytes), Ordering::Relaxed);
    }

    pub(crate) fn record_growth(&self, increment: isize) {
        let provided = self.bytes_provided.load(Ordering::Relaxed);
        self.bytes_provided
            .store(provided.wrapping_add(increment), Ordering::Relaxed);
    }

    /// Count an outer `malloc`, then run it.
    ///
    /// While `malloc` runs, nested [`wrap_malloc_r`](Self::wrap_malloc_r)
    /// calls aren't counted; the outer call already was.
    pub fn wrap_malloc<R>(&self, nbytes: usize, malloc: impl FnOnce() -> R) -> R {
        self.record_request(nbytes);
        let was_inside = self.inside_malloc.load(Ordering::Relaxed);
        self.inside_malloc.store(true, Ordering::Relaxed);
        let result = malloc();
        self.inside_malloc.store(was_inside, Ordering::Relaxed);
        result
    }

    /// Count a reentrant `_malloc_r`, unless an outer `malloc` is already
    /// counted, then run it.
    pub fn wrap_malloc_r<R>(&self, nbytes: usize, malloc_r: impl FnOnce() -> R) -> R {
        if !self.inside_malloc.load(Ordering::Relaxed) {
            self.record_request(nbytes);
        }
        malloc_r()
    }
}

#[cfg(test)]
mod tests {
    use super::{Diagnostics, DiagnosticsInfo};

    #[test]
    fn nested_malloc_r_counts_once() {
        let diag = Diagnostics::new();

        let ptr = diag.wrap_malloc(24, || diag.wrap_malloc_r(24, || 0xdead_usize));
        assert_eq!(ptr, 0xdead);
        assert_eq!(
            diag.info(),
            DiagnosticsInfo {
                call_count: 1,
                total_bytes_requested: 24,
                bytes_provided: 0
            }
        );

        diag.wrap_malloc_r(8, || ());
        assert_eq!(diag.info().call_count, 2);
        assert_eq!(diag.info().total_bytes_requested, 32);
    }

    #[test]
    fn preempting_task_shares_the_outer_flag() {
        let diag = Diagnostics::new();

        // Another task's _malloc_r runs while this task's malloc is inside.
        diag.wrap_malloc(16, || {
            diag.wrap_malloc_r(40, || ());
        });
        assert_eq!(diag.info().call_count, 1);
        assert_eq!(diag.info().total_bytes_requested, 16);

        diag.wrap_malloc_r(40, || ());
        assert_eq!(diag.info().call_count, 2);
    }

    #[test]
    fn growth_is_net() {
        let diag = Diagnostics::new();
        diag.record_growth(4096);
        diag.record_growth(-1024);
        assert_eq!(diag.info().bytes_provided, 3072);
    }
}
