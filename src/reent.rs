// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! The runtime library's reentrancy context.

use core::ffi::c_int;

/// "Not enough space," as newlib numbers it.
pub const ENOMEM: c_int = 12;

/// A per-task reentrancy context.
///
/// The runtime library supplies one of these on every reentrant call. It
/// carries the task's error code, so that failures don't race through a
/// global `errno`. The heap only ever writes the error code. It never owns
/// or allocates a context.
///
/// The layout matches the leading `_errno` member of newlib's
/// `struct _reent`. A pointer to a real `struct _reent` can be viewed
/// as a `*mut Reent`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Reent {
    errno: c_int,
}

impl Reent {
    /// A context with no recorded error.
    pub const fn new() -> Self {
        Self { errno: 0 }
    }

    /// The most recently recorded error code.
    #[inline]
    pub const fn errno(&self) -> c_int {
        self.errno
    }

    /// Record an error code.
    #[inline]
    pub fn set_errno(&mut self, errno: c_int) {
        self.errno = errno;
    }

    /// Returns the recorded error code, and resets it to zero.
    #[inline]
    pub fn take_errno(&mut self) -> c_int {
        core::mem::take(&mut self.errno)
    }
}
