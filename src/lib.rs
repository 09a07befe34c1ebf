//! # Snappatch
//!
//! Reversible patching of guest comparison instructions for snapshot fuzzing
//!
//! Integrity checks in a guest (checksums, magic values, hash comparisons) gate
//! interesting paths behind values a mutator will never guess. Snappatch replaces the
//! comparison instruction guarding such a check with `cmp al, al` padded with `nop`s
//! to the exact length of the original instruction, so the check always passes. The
//! length comes from disassembling the guest's own code, so a patch never spills into
//! the next instruction.
//!
//! Patches are recorded with the original bytes they replace. They are applied and
//! restored as one batch, re-applied after every snapshot reset, and validated against
//! guest memory before each execution slice so that self-modifying code or a stale
//! patch list is detected rather than silently corrupting the guest.
//!
//! ## Roadmap of the repo:
//!
//! * [`decoder`]: Instruction length decoding and operand parsing
//! * [`patcher`]: The patch engine which applies, restores, and validates patches
//! * [`controller`]: Drives the patch engine from the redqueen work directory
//! * [`memory`]: Guest virtual memory access over a physical memory snapshot
//! * [`trace`]: Processor trace toggling around guest execution
//!
//! # Example:
//!
//! #### Check which addresses in a snapshot can be patched
//!
//! ```console
//! $ snappatch -p ./snapshot --cr3 0x1234000 check 0x401000 0x401020
//! ```
//!
//! #### Patch the snapshot in place and restore it later
//!
//! ```console
//! $ snappatch -p ./snapshot --cr3 0x1234000 apply -f patches.txt
//! $ snappatch -p ./snapshot restore
//! ```
//!
//! #### Drive the patches across fuzzing iterations
//!
//! ```rust
//! use snappatch::prelude::*;
//!
//! fn iteration<M: GuestMemory>(controller: &mut PatchController, memory: &mut M) -> Result<()> {
//!     controller.run_slice(memory, &mut NoTrace, |_memory| {
//!         // Run the guest until the next exit
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub use anyhow;
use anyhow::Result;
use clap::Parser;

pub mod addrs;
pub use addrs::{Cr3, PhysAddr, VirtAddr, Vcpu};

pub mod cmdline;
pub use cmdline::{CommandLineArgs, ProjectState, SubCommand};

pub mod config;
pub use config::Config;

pub mod controller;
pub use controller::{PatchController, Workdir};

pub mod decoder;
pub use decoder::{Operand, MAX_INSTRUCTION_SIZE};

pub mod memory;
pub use memory::{GuestMemory, Memory};

pub mod page_table;

pub mod patcher;
pub use patcher::{PatchInfo, Patcher, Validation};

pub mod trace;
pub use trace::{NoTrace, TraceToggle};

mod colors;
mod commands;
pub mod utils;

/// File in the project directory recording the patches applied to the snapshot
pub const APPLIED_PATCHES_FILE: &str = "patches.applied.json";

/// [`indexmap::IndexMap`] using the Fx hasher
pub(crate) type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, core::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Main entrypoint for the `snappatch` command line
///
/// # Errors
///
/// * Fail to parse the project directory
/// * The executed subcommand failed
pub fn patcher_main() -> Result<()> {
    // Parse the command line arguments
    let args = CommandLineArgs::parse();

    // Init the logger to, at minimum, info level
    let mut log_level = args.verbosity.log_level_filter();
    if matches!(
        log_level,
        log::LevelFilter::Off | log::LevelFilter::Warn | log::LevelFilter::Error
    ) {
        log_level = log::LevelFilter::Info;
    }

    env_logger::Builder::new().filter_level(log_level).init();

    // Get the snapshot state from the given project directory
    let proj_state = cmdline::get_project_state(&args.project)?;

    // Execute the specific subcommand
    match &args.command {
        SubCommand::Check(sub) => commands::check::run(&proj_state, args.vcpu()?, sub),
        SubCommand::Apply(sub) => commands::apply::run(&proj_state, args.vcpu()?, sub),
        SubCommand::Restore(sub) => commands::restore::run(&proj_state, sub),
        SubCommand::Disasm(sub) => commands::disasm::run(&proj_state, args.vcpu()?, sub),
        SubCommand::Operand(sub) => commands::operand::run(sub),
    }
}

/// Import most important snappatch functions, traits, and types.
/// ```
/// use snappatch::prelude::*;
/// ```
pub mod prelude {
    pub use super::{
        addrs::{Cr3, VirtAddr, Vcpu},
        anyhow,
        anyhow::Result,
        controller::PatchController,
        memory::{GuestMemory, Memory},
        patcher::{Patcher, Validation},
        patcher_main,
        trace::{NoTrace, TraceToggle},
    };
}
