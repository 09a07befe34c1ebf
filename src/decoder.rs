//! Instruction decoding of guest code and structural parsing of operand text

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter, Mnemonic};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::addrs::{VirtAddr, Vcpu};
use crate::memory::GuestMemory;

/// Largest instruction length the patcher will record
pub const MAX_INSTRUCTION_SIZE: usize = 64;

/// Number of bytes read to decode one instruction. x86 caps instructions at 15 bytes.
const DECODE_WINDOW: usize = 16;

/// Custom errors the decoder can throw
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The instruction could not be decoded or is longer than [`MAX_INSTRUCTION_SIZE`]
    #[error("Unsupported instruction at {0:x?}")]
    Unsupported(VirtAddr),

    /// The first byte of the instruction is not readable
    #[error("Instruction address {0:x?} is not mapped")]
    Unmapped(VirtAddr),

    /// Decoder bitness must be 16, 32 or 64
    #[error("Invalid decoder bitness: {0}")]
    InvalidBitness(u32),

    /// Formatting a decoded instruction failed
    #[error("Failed to format instruction at {0:x?}: {1}")]
    Format(VirtAddr, String),
}

lazy_static! {
    /// `<size> ptr <rest>`
    static ref PTR_SIZE: Regex = Regex::new(
        r"^(byte|word|dword|fword|qword|tbyte|tword|oword|xmmword|ymmword|zmmword)\s+ptr\s+(.*)$"
    )
    .expect("Invalid ptr size regex");

    /// `<segment>:<rest>`
    static ref SEGMENT: Regex =
        Regex::new(r"^([cdefgs]s)\s*:\s*(.*)$").expect("Invalid segment regex");

    /// `[<expression>]`
    static ref MEMORY: Regex = Regex::new(r"^\[(.*)\]$").expect("Invalid memory regex");

    /// Register names as emitted by Intel syntax disassembly
    static ref REGISTER: Regex = Regex::new(
        r"^(?:[re]?(?:ax|bx|cx|dx|si|di|sp|bp|ip)|[abcd][lh]|(?:si|di|sp|bp)l|r(?:[89]|1[0-5])[dwb]?|[cdefgs]s|[xyz]mm(?:[12]?[0-9]|3[01])|mm[0-7]|k[0-7]|st(?:\([0-7]\))?|cr[0-9]|dr[0-7]|[er]iz)$"
    )
    .expect("Invalid register regex");

    /// `<register>*<scale>` or `<scale>*<register>`
    static ref SCALED: Regex = Regex::new(
        r"^(?:([a-z][a-z0-9]*)\s*\*\s*([0-9]+)|([0-9]+)\s*\*\s*([a-z][a-z0-9]*))$"
    )
    .expect("Invalid scaled index regex");

    /// `0x<hex>`, `<hex>h` or `<decimal>`
    static ref NUMBER: Regex =
        Regex::new(r"^(?:0x([0-9a-f]+)|([0-9][0-9a-f]*)h|([0-9]+))$").expect("Invalid number regex");
}

/// Force the one-time compilation of the operand matching machinery. Parsing compiles
/// it on first use, this only moves that cost to a known point.
pub fn compile() {
    lazy_static::initialize(&PTR_SIZE);
    lazy_static::initialize(&SEGMENT);
    lazy_static::initialize(&MEMORY);
    lazy_static::initialize(&REGISTER);
    lazy_static::initialize(&SCALED);
    lazy_static::initialize(&NUMBER);
}

/// Structural description of one instruction operand.
///
/// Two operands compare equal when every field matches, including absent fields. This
/// identifies operands that reference the same location regardless of the value
/// stored there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Operand {
    /// Base register
    pub base: Option<String>,

    /// Index register
    pub index: Option<String>,

    /// Segment override
    pub segment: Option<String>,

    /// Displacement or immediate value
    pub offset: u64,

    /// Size in bytes from a `<size> ptr` annotation, 0 if not given
    pub ptr_size: u8,

    /// Index scale, 0 without an index
    pub scale: u8,

    /// Set if the whole operand text was understood
    pub was_present: bool,
}

impl Operand {
    /// Returns `true` if no register takes part in this operand
    #[must_use]
    pub fn is_imm(&self) -> bool {
        self.base.is_none() && self.index.is_none() && self.segment.is_none()
    }

    /// Reset this operand to the empty descriptor for reuse
    pub fn clear(&mut self) {
        self.base = None;
        self.index = None;
        self.segment = None;
        self.offset = 0;
        self.ptr_size = 0;
        self.scale = 0;
        self.was_present = false;
    }

    /// Fold one `+`/`-` separated term of an address expression into this operand.
    /// Returns `false` if the term is not understood.
    fn add_term(&mut self, negative: bool, term: &str) -> bool {
        if let Some(value) = parse_number(term) {
            self.offset = if negative {
                self.offset.wrapping_sub(value)
            } else {
                self.offset.wrapping_add(value)
            };

            return true;
        }

        // Registers can only be added
        if negative {
            return false;
        }

        if REGISTER.is_match(term) {
            if self.base.is_none() {
                self.base = Some(term.to_string());
            } else if self.index.is_none() {
                self.index = Some(term.to_string());
                self.scale = 1;
            } else {
                return false;
            }

            return true;
        }

        let Some(caps) = SCALED.captures(term) else {
            return false;
        };

        let (reg, scale) = match (caps.get(1), caps.get(2), caps.get(3), caps.get(4)) {
            (Some(reg), Some(scale), _, _) | (_, _, Some(scale), Some(reg)) => {
                (reg.as_str(), scale.as_str())
            }
            _ => return false,
        };

        let Ok(scale) = scale.parse::<u8>() else {
            return false;
        };

        if !matches!(scale, 1 | 2 | 4 | 8) || !REGISTER.is_match(reg) {
            return false;
        }

        if self.index.is_some() {
            return false;
        }

        self.index = Some(reg.to_string());
        self.scale = scale;
        true
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |reg: &Option<String>| reg.clone().unwrap_or_else(|| "-".to_string());

        write!(
            f,
            "base: {} index: {} segment: {} offset: {:#x} ptr_size: {} scale: {} present: {}",
            show(&self.base),
            show(&self.index),
            show(&self.segment),
            self.offset,
            self.ptr_size,
            self.scale,
            self.was_present
        )
    }
}

/// Returns `true` if both operands describe the same structural location
#[must_use]
pub fn operands_equal(a: &Operand, b: &Operand) -> bool {
    a == b
}

/// Parse a number as emitted by disassembly
fn parse_number(term: &str) -> Option<u64> {
    let caps = NUMBER.captures(term)?;

    if let Some(hex) = caps.get(1).or_else(|| caps.get(2)) {
        return u64::from_str_radix(hex.as_str(), 16).ok();
    }

    caps.get(3)?.as_str().parse().ok()
}

/// Get the byte size of a `<size> ptr` annotation
fn ptr_size(name: &str) -> u8 {
    match name {
        "byte" => 1,
        "word" => 2,
        "dword" => 4,
        "fword" => 6,
        "qword" => 8,
        "tbyte" | "tword" => 10,
        "oword" | "xmmword" => 16,
        "ymmword" => 32,
        "zmmword" => 64,
        _ => 0,
    }
}

/// Split an address expression into signed terms: `rax+rbx*4-0x10` becomes
/// `[(false, "rax"), (false, "rbx*4"), (true, "0x10")]`. Returns `None` for an empty
/// term such as in `rax++4`.
fn split_terms(expr: &str) -> Option<Vec<(bool, &str)>> {
    let expr = expr.trim();

    // A leading sign belongs to the first term
    let (mut negative, body) = match expr.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, expr.strip_prefix('+').unwrap_or(expr)),
    };

    let mut terms = Vec::new();
    let mut start = 0;

    for (i, c) in body.char_indices() {
        if c != '+' && c != '-' {
            continue;
        }

        let term = body[start..i].trim();
        if term.is_empty() {
            return None;
        }

        terms.push((negative, term));
        negative = c == '-';
        start = i + 1;
    }

    let term = body[start..].trim();
    if term.is_empty() {
        return None;
    }

    terms.push((negative, term));
    Some(terms)
}

/// Parse the textual form of one operand into an [`Operand`].
///
/// Parsing is best effort and lossy. Fields that were matched are kept, and
/// `was_present` is only set when the entire text was understood.
///
/// ```
/// # use snappatch::decoder::parse_operand;
/// let op = parse_operand("dword ptr [rax+rbx*4+0x10]");
/// assert_eq!(op.base.as_deref(), Some("rax"));
/// assert_eq!(op.index.as_deref(), Some("rbx"));
/// assert_eq!((op.scale, op.offset, op.ptr_size), (4, 0x10, 4));
/// ```
#[must_use]
pub fn parse_operand(text: &str) -> Operand {
    let mut op = Operand::default();

    let lower = text.trim().to_ascii_lowercase();
    let mut rest = lower.as_str();

    if let Some(caps) = PTR_SIZE.captures(rest) {
        op.ptr_size = ptr_size(&caps[1]);
        rest = caps.get(2).map_or("", |m| m.as_str()).trim();
    }

    if let Some(caps) = SEGMENT.captures(rest) {
        op.segment = Some(caps[1].to_string());
        rest = caps.get(2).map_or("", |m| m.as_str()).trim();
    }

    if let Some(caps) = MEMORY.captures(rest) {
        rest = caps.get(1).map_or("", |m| m.as_str()).trim();

        // Some syntaxes place the segment inside the brackets
        if op.segment.is_none() {
            if let Some(caps) = SEGMENT.captures(rest) {
                op.segment = Some(caps[1].to_string());
                rest = caps.get(2).map_or("", |m| m.as_str()).trim();
            }
        }
    }

    let Some(terms) = split_terms(rest) else {
        return op;
    };

    for (negative, term) in terms {
        if !op.add_term(negative, term) {
            return op;
        }
    }

    op.was_present = true;
    op
}

/// Read the bytes of the instruction at `virt_addr`. Reads stop at the first unmapped
/// page, so an instruction at the end of the last mapped page can still be decoded.
fn read_instruction_bytes<M: GuestMemory>(
    memory: &M,
    vcpu: Vcpu,
    virt_addr: VirtAddr,
) -> Result<([u8; DECODE_WINDOW], usize), Error> {
    let mut bytes = [0_u8; DECODE_WINDOW];

    let first = (virt_addr.bytes_left_in_page() as usize).min(DECODE_WINDOW);

    memory
        .read_bytes(virt_addr, &mut bytes[..first], vcpu)
        .map_err(|_| Error::Unmapped(virt_addr))?;

    if first == DECODE_WINDOW {
        return Ok((bytes, first));
    }

    let Some(next_page) = virt_addr.checked_offset(first as u64) else {
        return Ok((bytes, first));
    };

    match memory.read_bytes(next_page, &mut bytes[first..], vcpu) {
        Ok(()) => Ok((bytes, DECODE_WINDOW)),
        Err(_) => Ok((bytes, first)),
    }
}

/// Decode the [`Instruction`] at `virt_addr` from current guest memory
///
/// # Errors
///
/// * The instruction address is unmapped
/// * The bytes do not decode, or the decoded length exceeds [`MAX_INSTRUCTION_SIZE`]
pub fn instruction_at<M: GuestMemory>(
    memory: &M,
    vcpu: Vcpu,
    virt_addr: VirtAddr,
    bitness: u32,
) -> Result<Instruction, Error> {
    if !matches!(bitness, 16 | 32 | 64) {
        return Err(Error::InvalidBitness(bitness));
    }

    let (bytes, len) = read_instruction_bytes(memory, vcpu, virt_addr)?;

    // Create an empty instruction
    let mut instr = Instruction::default();

    let mut decoder = Decoder::with_ip(bitness, &bytes[..len], virt_addr.0, DecoderOptions::NONE);
    decoder.decode_out(&mut instr);

    // Running out of bytes also decodes as invalid
    if instr.is_invalid() || instr.len() == 0 || instr.len() > MAX_INSTRUCTION_SIZE {
        return Err(Error::Unsupported(virt_addr));
    }

    Ok(instr)
}

/// Get the exact byte length of the instruction at `virt_addr`
///
/// # Errors
///
/// * See [`instruction_at`]
pub fn instruction_length<M: GuestMemory>(
    memory: &M,
    vcpu: Vcpu,
    virt_addr: VirtAddr,
    bitness: u32,
) -> Result<usize, Error> {
    Ok(instruction_at(memory, vcpu, virt_addr, bitness)?.len())
}

/// Returns `true` if the instruction only sets flags from a comparison
#[must_use]
pub fn is_compare(instr: &Instruction) -> bool {
    matches!(instr.mnemonic(), Mnemonic::Cmp | Mnemonic::Test)
}

/// A decoded instruction with its text and parsed operands
#[derive(Debug, Clone)]
pub struct Disassembly {
    /// The decoded instruction
    pub instruction: Instruction,

    /// Intel syntax text of the whole instruction
    pub text: String,

    /// Text of each operand alongside its parsed form
    pub operands: Vec<(String, Operand)>,
}

/// Create the formatter whose output [`parse_operand`] understands
fn formatter() -> IntelFormatter {
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_uppercase_hex(false);
    formatter.options_mut().set_hex_prefix("0x");
    formatter.options_mut().set_hex_suffix("");
    formatter.options_mut().set_space_after_operand_separator(true);
    formatter.options_mut().set_rip_relative_addresses(true);
    formatter
        .options_mut()
        .set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter
}

/// Decode the instruction at `virt_addr` and parse each of its operands
///
/// # Errors
///
/// * See [`instruction_at`]
/// * Formatting an operand failed
pub fn disassemble<M: GuestMemory>(
    memory: &M,
    vcpu: Vcpu,
    virt_addr: VirtAddr,
    bitness: u32,
) -> Result<Disassembly, Error> {
    let instruction = instruction_at(memory, vcpu, virt_addr, bitness)?;

    let mut formatter = formatter();

    let mut text = String::new();
    formatter.format(&instruction, &mut text);

    let mut operands = Vec::new();
    for index in 0..formatter.operand_count(&instruction) {
        let mut op_text = String::new();
        formatter
            .format_operand(&instruction, &mut op_text, index)
            .map_err(|err| Error::Format(virt_addr, err.to_string()))?;

        let op = parse_operand(&op_text);
        operands.push((op_text, op));
    }

    Ok(Disassembly {
        instruction,
        text,
        operands,
    })
}
