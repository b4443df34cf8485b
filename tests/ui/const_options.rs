// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

use heapshare::{arena::Exhausted, Fault, HeapOptions, OomPolicy};

fn out_of_memory(exhausted: Exhausted) {
    panic!("wanted {} bytes", exhausted.increment);
}

fn trap(fault: Fault) -> ! {
    panic!("{fault}");
}

/// Options can be built in a const context, for a static heap.
const OPTIONS: HeapOptions = HeapOptions::new()
    .with_oom(OomPolicy::Hook(out_of_memory))
    .with_trap(trap);

fn main() {
    assert!(matches!(OPTIONS.oom, OomPolicy::Hook(_)));

    let mut options = HeapOptions::default();
    options.oom = OomPolicy::Halt;
    assert!(matches!(options.oom, OomPolicy::Halt));
}
