// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: Copyright 2024 Ian McIntyre

use std::{env, fs, path::PathBuf};

#[path = "build_config.rs"]
mod build_config;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for variable in build_config::VARIABLES {
        println!("cargo::rerun-if-env-changed={variable}");
    }

    let cubemx_symbols = env::var_os("CARGO_FEATURE_CUBEMX_SYMBOLS").is_some();
    let config = build_config::read(|name| env::var(name), cubemx_symbols)?;
    for warning in &config.warnings {
        println!("cargo::warning={warning}");
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    fs::write(out_dir.join("config.rs"), config.to_rust())?;

    Ok(())
}
