//! Various utility functions

use crate::colors::Colorized;

use std::fmt::Write;

/// Format `data` as space separated hex bytes
///
/// Example:
///
/// ```
/// # use snappatch::utils::hex_bytes;
/// assert_eq!(hex_bytes(&[0x38, 0xc0, 0x90]), "38 c0 90");
/// ```
#[must_use]
pub fn hex_bytes(data: &[u8]) -> String {
    let mut res = String::with_capacity(data.len() * 3);

    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            res.push(' ');
        }

        let _ = write!(res, "{b:02x}");
    }

    res
}

/// Print a hexdump of `data` as if it started at `starting_address`, highlighting the
/// bytes of the compare patch
pub fn hexdump(data: &[u8], starting_address: u64) {
    println!(
        "{:-^18}   0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F    0123456789ABCDEF",
        " address "
    );

    for (i, chunk) in data.chunks(0x10).enumerate() {
        // Display the current address
        print!("{:#018x}: ", starting_address + i as u64 * 0x10);

        // Display the bytes
        for b in chunk {
            match b {
                0x38 | 0xc0 => print!("{:02x} ", b.red()),
                0x90 => print!("{:02x} ", b.cyan()),
                0x00 => print!("{:02x} ", b.green()),
                _ => print!("{b:02x} "),
            }
        }

        // Pad chunks that are not 16 bytes wide
        if chunk.len() < 16 {
            print!("{}", " ".repeat((16 - chunk.len()) * 3));
        }

        // Add the separation
        print!(" | ");

        // Display the bytes as characters
        for b in chunk {
            match b {
                0x21..=0x7e => print!("{}", (*b as char).yellow()),
                _ => print!("."),
            }
        }

        // Go to the next line
        println!();
    }
}
