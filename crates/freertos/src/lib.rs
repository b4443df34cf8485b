// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! heapshare for FreeRTOS and newlib.
//!
//! Link this package to replace FreeRTOS' `heap_N.c`. It provides the
//! symbols that newlib and FreeRTOS expect from a heap implementation:
//!
//! | Symbol | Caller | Behavior |
//! | --- | --- | --- |
//! | `_sbrk_r`, `sbrk`, `_sbrk` | newlib | [`Heap::sbrk_r_raw`] |
//! | `__malloc_lock`, `__malloc_unlock` | newlib | [`Heap::malloc_lock`] |
//! | `__env_lock`, `__env_unlock` | newlib | [`Heap::env_lock`] |
//! | `pvPortMalloc`, `vPortFree` | FreeRTOS | [`Heap::allocate`], [`Heap::free`] |
//! | `xPortGetFreeHeapSize` | FreeRTOS | [`Heap::free_heap_size`] |
//! | `vPortInitialiseBlocks` | FreeRTOS | [`Heap::initialize_blocks`] |
//!
//! There's no `xPortGetMinimumEverFreeHeapSize`. newlib doesn't track a
//! low-water mark.
//!
//! The symbols are exported on bare-metal ARM targets. On a hosted target,
//! they're ordinary Rust functions, so that they can't shadow a hosted C
//! library. Other bare-metal architectures aren't supported; the heap
//! couldn't tell an interrupt from a task.
//!
//! # Memory
//!
//! The heap spans the linker symbols `__HeapBase` to `__HeapLimit`. With the
//! `cubemx-symbols` feature, it spans `end` to `_estack`, the symbols that
//! STM32CubeMX linker scripts define. In that layout, the interrupt stack
//! sits at the top of the heap region, so the build fails unless
//! `HEAPSHARE_ISR_STACK_BYTES` reserves it.
//!
//! The limit is fixed. Growth before the scheduler starts isn't bounded by
//! the stack pointer, so a main stack that shares the reserve must fit in
//! `HEAPSHARE_ISR_STACK_BYTES`.
//!
//! The symbols are read on the first growth request.
//!
//! # Out of memory
//!
//! By default, an exhausted heap sets `ENOMEM`, and `malloc` returns null.
//! Enable one of these features to change that:
//!
//! - `oom-hook`: call `vApplicationMallocFailedHook`, with the scheduler
//!   still suspended.
//! - `oom-halt`: stop at a breakpoint.
//!
//! # Diagnostics
//!
//! The `diagnostics` feature (default) counts calls to `pvPortMalloc`. To
//! count every `malloc`, enable `malloc-wrap`, and link with
//! `-Wl,--wrap=malloc -Wl,--wrap=_malloc_r`. Read the counters through
//! [`HEAP`].
//!
//! # Build configuration
//!
//! | Variable | Default | Meaning |
//! | --- | --- | --- |
//! | `HEAPSHARE_ISR_STACK_BYTES` | `0` | Bytes reserved at the top of the heap region. Required with `cubemx-symbols`. |
//! | `HEAPSHARE_ISR_STACK_CHECK` | `0` | `1` tells an interrupt stack monitor to run. See [`config`]. |
//! | `HEAPSHARE_NEWLIB_REENTRANT` | `1` | Must match `configUSE_NEWLIB_REENTRANT`. Any other value warns. |

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
// The exported symbols use FreeRTOS' names.
#![allow(non_snake_case)]

#[cfg(all(feature = "oom-hook", feature = "oom-halt"))]
compile_error!("Enable at most one of the 'oom-hook' and 'oom-halt' features");

#[cfg(all(target_os = "none", not(target_arch = "arm")))]
compile_error!("heapshare-freertos only detects interrupts on bare-metal ARM");

use core::ffi::c_void;

use heapshare::{
    arena::{Arena, Region},
    Delegate, ExclusiveRegion, Fault, Heap, HeapOptions, HeapServices, InterruptProbe, OomPolicy,
    Reent,
};

/// Build-time configuration.
///
/// A separate interrupt stack monitor can read these values, so that it
/// agrees with the heap about where the interrupt stack lives.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

mod ffi {
    use core::ffi::{c_long, c_void};

    use heapshare::Reent;

    /// `BaseType_t` on 32-bit ports.
    pub(crate) type BaseType = c_long;

    /// newlib's `struct mallinfo`.
    #[repr(C)]
    #[allow(dead_code)]
    pub(crate) struct Mallinfo {
        pub(crate) arena: usize,
        pub(crate) ordblks: usize,
        pub(crate) smblks: usize,
        pub(crate) hblks: usize,
        pub(crate) hblkhd: usize,
        pub(crate) usmblks: usize,
        pub(crate) fsmblks: usize,
        pub(crate) uordblks: usize,
        pub(crate) fordblks: usize,
        pub(crate) keepcost: usize,
    }

    extern "C" {
        pub(crate) fn vTaskSuspendAll();
        pub(crate) fn xTaskResumeAll() -> BaseType;
        #[cfg(feature = "oom-hook")]
        pub(crate) fn vApplicationMallocFailedHook();

        #[cfg(not(feature = "malloc-wrap"))]
        pub(crate) fn malloc(size: usize) -> *mut c_void;
        #[cfg(feature = "malloc-wrap")]
        #[link_name = "__real_malloc"]
        pub(crate) fn malloc(size: usize) -> *mut c_void;
        #[cfg(feature = "malloc-wrap")]
        pub(crate) fn __real__malloc_r(reent: *mut Reent, size: usize) -> *mut c_void;
        pub(crate) fn free(ptr: *mut c_void);
        pub(crate) fn mallinfo() -> Mallinfo;

        pub(crate) static mut _impure_ptr: *mut Reent;

        #[cfg_attr(feature = "cubemx-symbols", link_name = "end")]
        #[cfg_attr(not(feature = "cubemx-symbols"), link_name = "__HeapBase")]
        pub(crate) static mut HEAP_BASE: u8;
        #[cfg_attr(feature = "cubemx-symbols", link_name = "_estack")]
        #[cfg_attr(not(feature = "cubemx-symbols"), link_name = "__HeapLimit")]
        pub(crate) static mut HEAP_LIMIT: u8;
    }
}

/// FreeRTOS' scheduler, as a heap port.
///
/// The exclusive region is scheduler suspension, which nests, and which
/// FreeRTOS allows before the scheduler starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeRtos;

// Safety: while the scheduler is suspended, no other task runs. This is a
// single-core system.
unsafe impl ExclusiveRegion for FreeRtos {
    fn enter(&self) {
        // Safety: callable from any task, and before the scheduler starts.
        unsafe { ffi::vTaskSuspendAll() }
    }
    unsafe fn exit(&self) {
        // Safety: the caller pairs this with a suspension. The result only
        // says whether resuming yielded.
        unsafe { ffi::xTaskResumeAll() };
    }
}

impl InterruptProbe for FreeRtos {
    /// Reads the active vector, like the port's `xPortIsInsideInterrupt`.
    fn is_inside_interrupt(&self) -> bool {
        #[cfg(all(target_arch = "arm", target_os = "none"))]
        {
            use cortex_m::peripheral::{scb::VectActive, SCB};
            SCB::vect_active() != VectActive::ThreadMode
        }
        #[cfg(not(all(target_arch = "arm", target_os = "none")))]
        {
            false
        }
    }
}

/// newlib's allocator.
///
/// newlib finds the heap's services through the exported `_sbrk_r` and
/// `__malloc_lock`. It never looks at the services it's handed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Newlib;

// Safety: newlib's malloc returns MALLOC_ALIGNMENT (8) aligned blocks, and
// only grows through _sbrk_r. mallinfo's fordblks counts free chunks that
// newlib already took from the arena.
unsafe impl Delegate for Newlib {
    fn malloc(&self, _: &dyn HeapServices, size: usize) -> *mut u8 {
        // Safety: newlib's malloc accepts any size.
        unsafe { ffi::malloc(size) }.cast()
    }

    unsafe fn free(&self, _: &dyn HeapServices, block: *mut u8) {
        // Safety: the caller promises the block came from malloc.
        unsafe { ffi::free(block.cast()) }
    }

    fn free_list_bytes(&self, _: &dyn HeapServices) -> usize {
        // Safety: mallinfo takes the allocator lock on its own.
        unsafe { ffi::mallinfo() }.fordblks
    }
}

/// The heap that backs newlib and FreeRTOS.
pub static HEAP: Heap<FreeRtos, Newlib> =
    Heap::new(FreeRtos, Newlib, Arena::deferred(linker_region), OPTIONS);

const OPTIONS: HeapOptions = HeapOptions::new().with_oom(OOM).with_trap(trap);

#[cfg(feature = "oom-hook")]
const OOM: OomPolicy = OomPolicy::Hook(malloc_failed);
#[cfg(all(feature = "oom-halt", not(feature = "oom-hook")))]
const OOM: OomPolicy = OomPolicy::Halt;
#[cfg(not(any(feature = "oom-hook", feature = "oom-halt")))]
const OOM: OomPolicy = OomPolicy::Errno;

fn linker_region() -> Region {
    let base = &raw mut ffi::HEAP_BASE;
    let limit = &raw mut ffi::HEAP_LIMIT;
    Region::new(base, limit).reserve_top(config::ISR_STACK_BYTES)
}

#[cfg(feature = "oom-hook")]
fn malloc_failed(exhausted: heapshare::arena::Exhausted) {
    #[cfg(feature = "defmt")]
    defmt::error!("malloc failed: {}", exhausted);
    #[cfg(not(feature = "defmt"))]
    let _ = exhausted;
    // Safety: the application provides the hook when it enables oom-hook.
    unsafe { ffi::vApplicationMallocFailedHook() }
}

fn trap(fault: Fault) -> ! {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    {
        #[cfg(feature = "defmt")]
        defmt::error!("heap fault: {}", fault);
        let _ = fault;
        loop {
            cortex_m::asm::bkpt();
        }
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        heapshare::halt(fault)
    }
}

/// newlib's reentrant growth function.
///
/// # Safety
///
/// `reent` must be null, or point to a valid `struct _reent`.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub unsafe extern "C" fn _sbrk_r(reent: *mut Reent, increment: isize) -> *mut c_void {
    // Safety: newlib hands over its own context, or null.
    unsafe { HEAP.sbrk_r_raw(reent, increment) }
}

/// Non-reentrant growth, through the ambient reentrancy context.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn sbrk(increment: isize) -> *mut c_void {
    // Safety: newlib initializes _impure_ptr before main, and never frees it.
    unsafe { _sbrk_r(ffi::_impure_ptr, increment) }
}

/// Non-reentrant growth, through the ambient reentrancy context.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn _sbrk(increment: isize) -> *mut c_void {
    sbrk(increment)
}

/// Take newlib's allocator lock.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn __malloc_lock(_: *mut Reent) {
    HEAP.malloc_lock();
}

/// Release newlib's allocator lock.
///
/// # Safety
///
/// Must pair with a prior `__malloc_lock`.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub unsafe extern "C" fn __malloc_unlock(_: *mut Reent) {
    // Safety: newlib pairs each unlock with a lock.
    unsafe { HEAP.malloc_unlock() }
}

/// Take newlib's environment lock.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn __env_lock(_: *mut Reent) {
    HEAP.env_lock();
}

/// Release newlib's environment lock.
///
/// # Safety
///
/// Must pair with a prior `__env_lock`.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub unsafe extern "C" fn __env_unlock(_: *mut Reent) {
    // Safety: newlib pairs each unlock with a lock.
    unsafe { HEAP.env_unlock() }
}

/// FreeRTOS' allocate.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn pvPortMalloc(size: usize) -> *mut c_void {
    HEAP.allocate(size).cast()
}

/// FreeRTOS' free.
///
/// # Safety
///
/// `block` must be null, or a live block from `pvPortMalloc`.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub unsafe extern "C" fn vPortFree(block: *mut c_void) {
    // Safety: the caller promises that the block is live, and ours.
    unsafe { HEAP.free(block.cast()) }
}

/// FreeRTOS' free heap query.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn xPortGetFreeHeapSize() -> usize {
    HEAP.free_heap_size()
}

/// FreeRTOS' heap initializer. It does nothing.
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn vPortInitialiseBlocks() {
    HEAP.initialize_blocks();
}

/// Counts an application `malloc` when linked with `--wrap=malloc`.
#[cfg(feature = "malloc-wrap")]
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub extern "C" fn __wrap_malloc(size: usize) -> *mut c_void {
    HEAP.diagnostics().wrap_malloc(size, || {
        // Safety: newlib's malloc accepts any size.
        unsafe { ffi::malloc(size) }
    })
}

/// Counts a reentrant `_malloc_r` when linked with `--wrap=_malloc_r`.
///
/// # Safety
///
/// `reent` must point to a valid `struct _reent`.
#[cfg(feature = "malloc-wrap")]
#[doc(hidden)]
#[cfg_attr(target_os = "none", unsafe(no_mangle))]
pub unsafe extern "C" fn __wrap__malloc_r(reent: *mut Reent, size: usize) -> *mut c_void {
    HEAP.diagnostics().wrap_malloc_r(size, || {
        // Safety: the caller promises that reent is valid.
        unsafe { ffi::__real__malloc_r(reent, size) }
    })
}
