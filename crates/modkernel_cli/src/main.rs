//! CLI probe for the kernel core.
//!
//! # Responsibility
//! - Print the core version to verify `modkernel_core` linkage.
//! - Dump a mod's stored configuration without starting a host.
//!
//! Usage:
//! - `modkernel_cli` prints the version.
//! - `modkernel_cli dump <config_dir> <mod_name>` prints one
//!   `category.key = value (kind)` line per stored entry.

use modkernel_core::{Kernel, KernelResult, KernelSettings};
use std::process::ExitCode;

fn dump(config_dir: &str, mod_name: &str) -> KernelResult<usize> {
    let kernel = Kernel::new(KernelSettings::with_config_dir(config_dir))?;
    let module = kernel.attach_mod(mod_name)?;
    let printed = kernel.config().enumerate(&module, None, |key, value| {
        println!("{key} = {value} ({})", value.kind().as_str());
        true
    })?;
    kernel.detach_mod(&module)?;
    Ok(printed)
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {
            println!("modkernel_core version={}", modkernel_core::core_version());
            ExitCode::SUCCESS
        }
        [command, config_dir, mod_name] if command == "dump" => match dump(config_dir, mod_name) {
            Ok(count) => {
                eprintln!("{count} entries");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("dump failed: {err} (code {})", err.code());
                ExitCode::FAILURE
            }
        },
        _ => {
            eprintln!("usage: modkernel_cli [dump <config_dir> <mod_name>]");
            ExitCode::from(2)
        }
    }
}
