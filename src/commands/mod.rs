//! The available command line argument subcommands
pub mod apply;
pub mod check;
pub mod disasm;
pub mod operand;
pub mod restore;
