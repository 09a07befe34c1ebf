//! Execute the `disasm` command

use anyhow::{Context, Result};

use crate::colors::Colorized;
use crate::memory::GuestMemory;
use crate::utils::{hex_bytes, hexdump};
use crate::{cmdline, decoder, ProjectState, Vcpu};

/// Disassemble instructions starting at the requested address
pub(crate) fn run(project_state: &ProjectState, vcpu: Vcpu, args: &cmdline::Disasm) -> Result<()> {
    let memory = project_state.memory()?;
    let bitness = project_state.config().patcher.bitness;

    let start = args.addr;
    let mut addr = start;

    for _ in 0..args.count {
        let disasm = match decoder::disassemble(&memory, vcpu, addr, bitness) {
            Ok(disasm) => disasm,
            Err(err) => {
                log::warn!("{err}");
                break;
            }
        };

        let len = disasm.instruction.len();
        let mut bytes = vec![0_u8; len];
        memory.read_bytes(addr, &mut bytes, vcpu)?;

        if decoder::is_compare(&disasm.instruction) {
            println!("{addr:#018x} {:<30} {}", hex_bytes(&bytes), disasm.text.green());
        } else {
            println!("{addr:#018x} {:<30} {}", hex_bytes(&bytes), disasm.text);
        }

        if args.operands {
            for (text, operand) in &disasm.operands {
                println!("    {text:<32} {operand}");
            }
        }

        addr = addr
            .checked_offset(len as u64)
            .context("Disassembly ran off the end of the address space")?;
    }

    if args.hexdump && addr > start {
        let mut bytes = vec![0_u8; (addr.0 - start.0) as usize];
        memory.read_bytes(start, &mut bytes, vcpu)?;
        hexdump(&bytes, start.0);
    }

    Ok(())
}
