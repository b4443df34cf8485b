// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! heapshare lets an RTOS and a C runtime library share one heap.
//!
//! newlib's allocator manages its own free lists, and asks the system for
//! raw memory through `_sbrk_r`. FreeRTOS expects a heap that it can call
//! through `pvPortMalloc`, and that reports its free space. A [`Heap`] sits
//! between them. It owns a single [`Arena`](arena::Arena) carved from a
//! linker-provided region, and forwards allocations to a [`Delegate`]
//! allocator that grows into that arena.
//!
//! This package is portable and `no_std`. The `heapshare-freertos` package
//! connects it to FreeRTOS and newlib, and exports the C symbols those
//! libraries expect.
//!
//! # Getting started
//!
//! A heap needs a port, a delegate, an arena, and options. The port
//! supplies two capabilities:
//!
//! - an [`ExclusiveRegion`] that stops task preemption. On FreeRTOS, that's
//!   scheduler suspension.
//! - an [`InterruptProbe`] that detects interrupt context.
//!
//! The example below uses the simulated scheduler and the free-list
//! allocator from the `test_util` module. Enable the `test-utils` feature
//! to use them.
//!
//! ```
//! use heapshare::{
//!     arena::Arena,
//!     test_util::{ArenaStorage, FreeListDelegate, SimulatedScheduler},
//!     Heap, HeapOptions,
//! };
//!
//! let storage = ArenaStorage::<4096>::new();
//! let heap = Heap::new(
//!     SimulatedScheduler::new(),
//!     FreeListDelegate::new(),
//!     Arena::new(storage.region()),
//!     HeapOptions::default(),
//! );
//!
//! let block = heap.allocate(64);
//! assert!(!block.is_null());
//! assert_eq!(heap.free_heap_size(), 4096 - 64);
//!
//! // Safety: the block came from this heap, and it's still live.
//! unsafe { heap.free(block) };
//! assert_eq!(heap.free_heap_size(), 4096);
//! ```
//!
//! # Out of memory
//!
//! When the arena can't satisfy a growth request, the heap applies one
//! [`OomPolicy`]. It either calls an application hook, halts, or records
//! `ENOMEM` for the delegate. Choose the policy in [`HeapOptions`].
//!
//! # Faults
//!
//! Some mistakes can't be reported to the caller. If an interrupt handler
//! tries to allocate, or takes an allocator lock, the heap hands a
//! [`Fault`] to its trap function. The trap never returns.
//!
//! # Features
//!
//! - `diagnostics` (default): count allocations and provided bytes. See
//!   [`diagnostics`].
//! - `defmt`: log through `defmt`, and derive `defmt::Format` for the
//!   public error types.
//! - `test-utils`: expose host-side test doubles in `test_util`.

#![no_std]
#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    let_underscore_drop,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_numeric_casts,
    unsafe_op_in_unsafe_fn,
    unreachable_pub,
    unused_qualifications,
    clippy::cast_possible_truncation,
    clippy::map_unwrap_or,
    clippy::manual_assert,
    clippy::missing_safety_doc,
    clippy::ref_as_ptr,
    clippy::redundant_closure_for_method_calls,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::undocumented_unsafe_blocks,
    clippy::used_underscore_binding
)]
#![allow(
    missing_debug_implementations,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

#[cfg(any(test, feature = "test-utils"))]
extern crate std;

/// Log through `defmt`, or do nothing.
macro_rules! log {
    ($level:ident, $($arg:tt)*) => {
        #[cfg(feature = "defmt")]
        {
            defmt::$level!($($arg)*);
        }
    };
}

#[macro_use]
mod panic;

pub mod arena;
#[cfg(feature = "diagnostics")]
pub mod diagnostics;
pub mod facade;
pub mod growth;
mod heap;
pub mod lock;
pub mod port;
pub mod reent;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use facade::Delegate;
pub use growth::SBRK_FAILED;
pub use heap::{Heap, HeapOptions, HeapServices, OomPolicy};
pub use panic::halt;
pub use port::{ExclusiveRegion, Fault, InterruptProbe};
pub use reent::{Reent, ENOMEM};

mod marker {
    use core::marker::PhantomData;

    /// A zero-sized type that's neither `Send` nor `Sync`.
    ///
    /// Use this marker when you have no other way to mark `!Send` or
    /// `!Sync` for your type. This type is valid to construct in a
    /// const context.
    pub(crate) struct NotSendOrSync(PhantomData<*mut ()>);
    impl NotSendOrSync {
        pub(crate) const fn mark() -> Self {
            Self(PhantomData)
        }
    }
}
