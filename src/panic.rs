// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Stopping the program on a fault.

use crate::port::Fault;

#[cfg(not(any(panic = "abort", panic = "unwind")))]
compile_error!("Unknown panic option!");

/// Force the program to abort.
///
/// This is stronger than a panic, since it never allows unwinding.
/// A heap fault happens while the scheduler may be suspended, and
/// while a C allocator holds its own state mid-update. Unwinding
/// back through that C code isn't an option. If the program would
/// normally abort on panic, then this is a normal panic.
macro_rules! abort {
    ($($arg:tt)*) => {{
        #[cfg(panic = "unwind")]
        {
            extern crate std;
            std::eprintln!($($arg)*);
            std::eprintln!("Aborting the heapshare program");
            std::process::abort();
        }
        #[cfg(panic = "abort")]
        {
            panic!($($arg)*);
        }
    }};
}

/// The default trap function.
///
/// Aborts the program, reporting the fault.
pub fn halt(fault: Fault) -> ! {
    log!(error, "heap fault: {}", fault);
    abort!("{}", fault)
}
