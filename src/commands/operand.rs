//! Execute the `operand` command

use anyhow::Result;

use crate::{cmdline, decoder};

/// Parse an operand and optionally compare it against another
pub(crate) fn run(args: &cmdline::Operand) -> Result<()> {
    decoder::compile();

    let operand = decoder::parse_operand(&args.text);
    println!("{operand}");
    println!("immediate: {}", operand.is_imm());

    if !operand.was_present {
        log::warn!("Operand {:?} was not fully understood", args.text);
    }

    if let Some(other) = &args.compare {
        let other = decoder::parse_operand(other);
        println!("{other}");
        println!("equal: {}", decoder::operands_equal(&operand, &other));
    }

    Ok(())
}
