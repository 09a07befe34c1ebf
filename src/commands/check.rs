//! Execute the `check` command

use anyhow::Result;

use crate::colors::Colorized;
use crate::patcher::{Patcher, Skipped};
use crate::utils::hex_bytes;
use crate::{cmdline, decoder, ProjectState, Vcpu};

/// Report which of the requested addresses can be patched. The snapshot is not
/// modified.
pub(crate) fn run(project_state: &ProjectState, vcpu: Vcpu, args: &cmdline::Check) -> Result<()> {
    let config = project_state.config();
    let addrs = args.addresses.resolve(config)?;

    let mut memory = project_state.memory()?;
    let mut patcher = Patcher::with_config(vcpu, &config.patcher)?;

    // Nothing is applied yet, so recording only reads guest memory
    let skipped = patcher.set_addresses(&mut memory, &addrs)?;

    for info in patcher.records() {
        let text = decoder::disassemble(&memory, vcpu, info.addr(), config.patcher.bitness)
            .map(|disasm| disasm.text)
            .unwrap_or_default();

        println!(
            "{:#018x} {} {:<30} {text}",
            info.addr(),
            "OK  ".green(),
            hex_bytes(info.original_bytes()),
        );
    }

    for Skipped { addr, reason } in &skipped {
        println!("{addr:#018x} {} {reason}", "SKIP".red());
    }

    log::info!(
        "{} of {} addresses can be patched",
        patcher.len(),
        addrs.len()
    );

    Ok(())
}
