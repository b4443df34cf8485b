// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

//! Build-time configuration, shared by `build.rs` and its tests.

use std::env::VarError;

/// Bytes at the top of the heap region that belong to the interrupt stack.
pub const ISR_STACK_BYTES: &str = "HEAPSHARE_ISR_STACK_BYTES";
/// Enables the interrupt stack check that sits beside the heap.
pub const ISR_STACK_CHECK: &str = "HEAPSHARE_ISR_STACK_CHECK";
/// Mirrors FreeRTOS' `configUSE_NEWLIB_REENTRANT`.
pub const NEWLIB_REENTRANT: &str = "HEAPSHARE_NEWLIB_REENTRANT";

/// Every variable that the build reads.
pub const VARIABLES: [&str; 3] = [ISR_STACK_BYTES, ISR_STACK_CHECK, NEWLIB_REENTRANT];

/// The parsed configuration.
#[derive(Debug, PartialEq, Eq)]
pub struct Config {
    pub isr_stack_bytes: usize,
    pub isr_stack_check: bool,
    /// Messages for `cargo::warning`.
    pub warnings: Vec<String>,
}

/// Parse the configuration.
///
/// `var` looks up an environment variable. `cubemx_symbols` says whether
/// the heap ends at `_estack`, where the interrupt stack begins; that
/// layout needs a non-zero interrupt stack reserve.
pub fn read(
    var: impl Fn(&str) -> Result<String, VarError>,
    cubemx_symbols: bool,
) -> Result<Config, String> {
    let mut warnings = Vec::new();

    let isr_stack_bytes: usize = match var(ISR_STACK_BYTES) {
        Ok(bytes) => bytes
            .trim()
            .parse()
            .map_err(|err| format!("{ISR_STACK_BYTES}={bytes} isn't a byte count: {err}"))?,
        Err(VarError::NotPresent) => 0,
        Err(err) => return Err(format!("{ISR_STACK_BYTES}: {err}")),
    };
    if cubemx_symbols && isr_stack_bytes == 0 {
        return Err(format!(
            "cubemx-symbols places the interrupt stack at the top of the heap region. \
             Set {ISR_STACK_BYTES} to the interrupt stack's size."
        ));
    }

    let isr_stack_check = match var(ISR_STACK_CHECK).as_deref().map(str::trim) {
        Ok("1") => true,
        Ok("0") | Err(VarError::NotPresent) => false,
        Ok(other) => return Err(format!("{ISR_STACK_CHECK}={other} isn't 0 or 1")),
        Err(err) => return Err(format!("{ISR_STACK_CHECK}: {err}")),
    };
    if isr_stack_check && isr_stack_bytes == 0 {
        warnings.push(format!(
            "{ISR_STACK_CHECK}=1 needs a non-zero {ISR_STACK_BYTES}"
        ));
    }

    let reentrant = var(NEWLIB_REENTRANT).unwrap_or_else(|_| "1".into());
    if reentrant.trim() != "1" {
        warnings.push(format!(
            "Set {NEWLIB_REENTRANT}=1, and configUSE_NEWLIB_REENTRANT to 1. \
             newlib's sprintf, dtoa, and strtok aren't thread safe without it."
        ));
    }

    Ok(Config {
        isr_stack_bytes,
        isr_stack_check,
        warnings,
    })
}

impl Config {
    /// The `config` module source.
    pub fn to_rust(&self) -> String {
        format!(
            "/// Bytes reserved for the interrupt stack, from `{ISR_STACK_BYTES}`.\n\
             pub const ISR_STACK_BYTES: usize = {};\n\
             /// Whether the interrupt stack check is enabled, from `{ISR_STACK_CHECK}`.\n\
             pub const ISR_STACK_CHECK: bool = {};\n",
            self.isr_stack_bytes, self.isr_stack_check
        )
    }
}
