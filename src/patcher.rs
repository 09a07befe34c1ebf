//! Reversible patching of guest comparison instructions
//!
//! A [`Patcher`] records the original bytes of the instruction at each requested
//! address and swaps them for [`CMP_PATCH`] as one batch. The decoded instruction
//! length is the only size ever used for writes, reads and validation, so the byte
//! after each patch is always the next original instruction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addrs::{VirtAddr, Vcpu};
use crate::config;
use crate::decoder::{self, MAX_INSTRUCTION_SIZE};
use crate::memory::{self, GuestMemory};
use crate::FxIndexMap;

/// `cmp al, al`: a comparison that always evaluates as equal
const CMP_AL_AL: [u8; 2] = [0x38, 0xc0];

/// Single byte `nop` used to pad the patch to the instruction length
const NOP: u8 = 0x90;

/// Build [`CMP_PATCH`]
const fn cmp_patch() -> [u8; MAX_INSTRUCTION_SIZE] {
    let mut patch = [NOP; MAX_INSTRUCTION_SIZE];
    patch[0] = CMP_AL_AL[0];
    patch[1] = CMP_AL_AL[1];
    patch
}

/// Patch written over comparison instructions so that hash and checksum checks always
/// pass. Only the first `size` bytes are written for an instruction of `size` bytes.
pub const CMP_PATCH: [u8; MAX_INSTRUCTION_SIZE] = cmp_patch();

/// Custom errors the [`Patcher`] can throw
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The patch address is not mapped in the guest
    #[error("Patch address {0:x?} is not mapped")]
    AddressUnmapped(VirtAddr),

    /// The instruction at the patch address could not be decoded or is too long
    #[error("Unsupported instruction at patch address {0:x?}")]
    DecodeUnsupported(VirtAddr),

    /// The instruction is shorter than the compare opcode
    #[error("Instruction at {0:x?} is {1} byte(s), too short to hold the compare patch")]
    InstructionTooShort(VirtAddr, usize),

    /// The instruction shares bytes with an instruction that is already recorded
    #[error("Instruction at {addr:x?} overlaps the patch at {existing:x?}")]
    OverlappingPatch {
        /// The rejected address
        addr: VirtAddr,

        /// The recorded patch it overlaps
        existing: VirtAddr,
    },

    /// The address appears more than once in the address list
    #[error("Duplicate patch address {0:x?}")]
    DuplicateAddress(VirtAddr),

    /// Reading the original bytes failed
    #[error("Failed to read original bytes at {0:x?}: {1}")]
    MemoryReadFailed(VirtAddr, memory::Error),

    /// Writing patch or original bytes failed
    #[error("Failed to write patch bytes at {0:x?}: {1}")]
    MemoryWriteFailed(VirtAddr, memory::Error),

    /// Guest bytes at the address differ from what the patcher expects
    #[error("Guest bytes at {0:x?} do not match the patch state")]
    ValidationMismatch(VirtAddr),

    /// Decoder bitness must be 16, 32 or 64
    #[error("Invalid decoder bitness: {0}")]
    InvalidBitness(u32),

    /// A saved patch record is larger than [`MAX_INSTRUCTION_SIZE`] or empty
    #[error("Saved patch at {0:x?} has an invalid size of {1} bytes")]
    InvalidRecord(VirtAddr, usize),
}

/// Serialized form of a [`PatchInfo`]
#[derive(Serialize, Deserialize)]
struct SavedPatch {
    /// Address of the patched instruction
    addr: VirtAddr,

    /// The instruction bytes before patching
    orig_bytes: Vec<u8>,
}

/// One instruction to patch along with the bytes it held before patching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SavedPatch", into = "SavedPatch")]
pub struct PatchInfo {
    /// Address of the instruction
    addr: VirtAddr,

    /// Decoded length of the instruction, fixed when the record is captured
    size: usize,

    /// Original instruction bytes, only the first `size` are meaningful
    orig_bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl PatchInfo {
    /// Create a record for the instruction at `addr` whose original bytes are `orig`
    ///
    /// # Errors
    ///
    /// * `orig` is empty or longer than [`MAX_INSTRUCTION_SIZE`]
    pub fn new(addr: VirtAddr, orig: &[u8]) -> Result<Self, Error> {
        if orig.is_empty() || orig.len() > MAX_INSTRUCTION_SIZE {
            return Err(Error::InvalidRecord(addr, orig.len()));
        }

        let mut orig_bytes = [0; MAX_INSTRUCTION_SIZE];
        orig_bytes[..orig.len()].copy_from_slice(orig);

        Ok(Self {
            addr,
            size: orig.len(),
            orig_bytes,
        })
    }

    /// Address of the patched instruction
    #[must_use]
    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    /// Length of the patched instruction
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The bytes of the instruction before it was patched
    #[must_use]
    pub fn original_bytes(&self) -> &[u8] {
        &self.orig_bytes[..self.size]
    }

    /// The bytes written over this instruction when patched
    #[must_use]
    pub fn patch_bytes(&self) -> &'static [u8] {
        &CMP_PATCH[..self.size]
    }

    /// Returns `true` if `[start, end)` shares a byte with this instruction
    fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.addr.0.saturating_add(self.size as u64) && self.addr.0 < end
    }
}

impl TryFrom<SavedPatch> for PatchInfo {
    type Error = Error;

    fn try_from(saved: SavedPatch) -> Result<Self, Self::Error> {
        PatchInfo::new(saved.addr, &saved.orig_bytes)
    }
}

impl From<PatchInfo> for SavedPatch {
    fn from(info: PatchInfo) -> Self {
        SavedPatch {
            addr: info.addr,
            orig_bytes: info.original_bytes().to_vec(),
        }
    }
}

/// An address from the address list that was not recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    /// The address that was skipped
    pub addr: VirtAddr,

    /// Why it was skipped
    pub reason: Error,
}

/// Result of comparing guest memory against the patcher's view of it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Every record holds the bytes the patcher expects
    Consistent,

    /// Patches are marked applied but every record holds its original bytes. This is
    /// what a snapshot reset looks like and only means the patches must be re-applied.
    NeedsApply,

    /// The first record whose bytes match neither expectation, or that can't be read
    Diverged(VirtAddr),
}

/// Installs, removes and validates the patch set for one guest context
#[derive(Debug)]
pub struct Patcher {
    /// The vCPU whose view of memory is patched
    vcpu: Vcpu,

    /// Recorded patches in address list order
    patches: FxIndexMap<VirtAddr, PatchInfo>,

    /// Set if the guest currently holds the patch bytes for every record
    is_currently_applied: bool,

    /// Bitness used to decode instructions
    bitness: u32,

    /// Log patch targets that are not comparison instructions
    warn_non_compare: bool,
}

impl Patcher {
    /// Create an empty [`Patcher`] for 64-bit code
    #[must_use]
    pub fn new(vcpu: Vcpu) -> Self {
        Self {
            vcpu,
            patches: FxIndexMap::default(),
            is_currently_applied: false,
            bitness: 64,
            warn_non_compare: true,
        }
    }

    /// Create an empty [`Patcher`] using the given configuration
    ///
    /// # Errors
    ///
    /// * The configured bitness is not 16, 32 or 64
    pub fn with_config(vcpu: Vcpu, config: &config::Patcher) -> Result<Self, Error> {
        if !matches!(config.bitness, 16 | 32 | 64) {
            return Err(Error::InvalidBitness(config.bitness));
        }

        Ok(Self {
            bitness: config.bitness,
            warn_non_compare: config.warn_non_compare,
            ..Self::new(vcpu)
        })
    }

    /// Rebuild a [`Patcher`] from previously captured records, for example records
    /// saved after patching a snapshot on disk
    #[must_use]
    pub fn from_records(vcpu: Vcpu, records: Vec<PatchInfo>, applied: bool) -> Self {
        let mut patcher = Self::new(vcpu);

        for info in records {
            patcher.patches.entry(info.addr).or_insert(info);
        }

        patcher.is_currently_applied = applied && !patcher.patches.is_empty();
        patcher
    }

    /// The vCPU this patcher operates on
    #[must_use]
    pub fn vcpu(&self) -> Vcpu {
        self.vcpu
    }

    /// Returns `true` if the guest is expected to hold the patch bytes
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.is_currently_applied
    }

    /// Number of recorded patches
    #[must_use]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Returns `true` if no patches are recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// The recorded patches in address list order
    pub fn records(&self) -> impl Iterator<Item = &PatchInfo> {
        self.patches.values()
    }

    /// Replace the recorded patches with the instructions at `addrs`.
    ///
    /// Existing records are restored first, applied or not, so that original bytes are
    /// never captured from patched memory and no patch is left behind untracked.
    /// Addresses that can't be patched are skipped and returned rather than failing
    /// the batch.
    ///
    /// # Errors
    ///
    /// * Restoring the existing records failed. Nothing is replaced.
    pub fn set_addresses<M: GuestMemory>(
        &mut self,
        memory: &mut M,
        addrs: &[VirtAddr],
    ) -> Result<Vec<Skipped>, Error> {
        if !self.patches.is_empty() {
            log::info!("Restoring {} patches before replacing them", self.patches.len());
            self.restore_all(memory)?;
        }

        self.patches.clear();

        let mut skipped = Vec::new();

        for &addr in addrs {
            match self.capture(memory, addr) {
                Ok(info) => {
                    log::debug!("Recorded patch {addr:#x} ({} bytes)", info.size);
                    self.patches.insert(addr, info);
                }
                Err(reason) => {
                    log::warn!("Skipping patch address {addr:#x}: {reason}");
                    skipped.push(Skipped { addr, reason });
                }
            }
        }

        log::info!(
            "Recorded {} of {} patch addresses",
            self.patches.len(),
            addrs.len()
        );

        Ok(skipped)
    }

    /// Decode the instruction at `addr` and save its original bytes
    fn capture<M: GuestMemory>(&self, memory: &M, addr: VirtAddr) -> Result<PatchInfo, Error> {
        if self.patches.contains_key(&addr) {
            return Err(Error::DuplicateAddress(addr));
        }

        if !memory.is_mapped(addr, self.vcpu) {
            return Err(Error::AddressUnmapped(addr));
        }

        let instr = decoder::instruction_at(memory, self.vcpu, addr, self.bitness).map_err(
            |err| match err {
                decoder::Error::Unmapped(addr) => Error::AddressUnmapped(addr),
                decoder::Error::InvalidBitness(bitness) => Error::InvalidBitness(bitness),
                decoder::Error::Unsupported(addr) | decoder::Error::Format(addr, _) => {
                    Error::DecodeUnsupported(addr)
                }
            },
        )?;

        let size = instr.len();

        if size < CMP_AL_AL.len() {
            return Err(Error::InstructionTooShort(addr, size));
        }

        let end = addr
            .0
            .checked_add(size as u64)
            .ok_or(Error::DecodeUnsupported(addr))?;

        if let Some(existing) = self.patches.values().find(|info| info.overlaps(addr.0, end)) {
            return Err(Error::OverlappingPatch {
                addr,
                existing: existing.addr,
            });
        }

        if self.warn_non_compare && !decoder::is_compare(&instr) {
            log::warn!(
                "Patch target {addr:#x} is {:?}, not a comparison",
                instr.mnemonic()
            );
        }

        let mut orig_bytes = [0_u8; MAX_INSTRUCTION_SIZE];
        memory
            .read_bytes(addr, &mut orig_bytes[..size], self.vcpu)
            .map_err(|err| Error::MemoryReadFailed(addr, err))?;

        Ok(PatchInfo {
            addr,
            size,
            orig_bytes,
        })
    }

    /// Write the patch bytes over every recorded instruction.
    ///
    /// Safe to call when already applied. If any write fails, the records already
    /// written are restored so the guest is never left partially patched.
    ///
    /// # Errors
    ///
    /// * Writing the patch for a record failed
    pub fn apply_all<M: GuestMemory>(&mut self, memory: &mut M) -> Result<(), Error> {
        let mut failed = None;

        for (index, info) in self.patches.values().enumerate() {
            if let Err(err) = memory.write_bytes(info.addr, info.patch_bytes(), self.vcpu) {
                failed = Some((index, Error::MemoryWriteFailed(info.addr, err)));
                break;
            }
        }

        let Some((failed_index, err)) = failed else {
            self.is_currently_applied = true;
            return Ok(());
        };

        log::error!("{err}, rolling back the patch batch");

        // Records after the failed one only hold patch bytes if a previous batch
        // applied them
        let rollback_end = if self.is_currently_applied {
            self.patches.len()
        } else {
            failed_index
        };

        for (index, info) in self.patches.values().enumerate().take(rollback_end) {
            if index == failed_index {
                continue;
            }

            if let Err(err) = memory.write_bytes(info.addr, info.original_bytes(), self.vcpu) {
                log::error!("Failed to roll back patch at {:#x}: {err}", info.addr);
            }
        }

        self.is_currently_applied = false;
        Err(err)
    }

    /// Write the original bytes back over every recorded instruction, whether or not
    /// the patches are currently marked applied.
    ///
    /// When the patches are applied and a write fails, the records already restored by
    /// this call are patched again so the batch stays fully applied. Otherwise every
    /// record is attempted even after a failure.
    ///
    /// # Errors
    ///
    /// * The first record whose original bytes could not be written
    pub fn restore_all<M: GuestMemory>(&mut self, memory: &mut M) -> Result<(), Error> {
        let mut first_err = None;

        for (index, info) in self.patches.values().enumerate() {
            let Err(err) = memory.write_bytes(info.addr, info.original_bytes(), self.vcpu) else {
                continue;
            };

            log::error!("Failed to restore original bytes at {:#x}: {err}", info.addr);

            if self.is_currently_applied {
                for restored in self.patches.values().take(index) {
                    if let Err(err) =
                        memory.write_bytes(restored.addr, restored.patch_bytes(), self.vcpu)
                    {
                        log::error!("Failed to re-patch {:#x}: {err}", restored.addr);
                    }
                }

                return Err(Error::MemoryWriteFailed(info.addr, err));
            }

            first_err.get_or_insert(Error::MemoryWriteFailed(info.addr, err));
        }

        if let Some(err) = first_err {
            return Err(err);
        }

        self.is_currently_applied = false;
        Ok(())
    }

    /// Compare guest memory against the expected bytes of every record. Never writes
    /// guest memory.
    #[must_use]
    pub fn validate<M: GuestMemory>(&self, memory: &M) -> Validation {
        let mut mismatch = None;
        let mut all_original = true;

        for info in self.patches.values() {
            let mut current = [0_u8; MAX_INSTRUCTION_SIZE];
            let current = &mut current[..info.size];

            if memory.read_bytes(info.addr, current, self.vcpu).is_err() {
                log::warn!("Patch address {:#x} is no longer readable", info.addr);
                return Validation::Diverged(info.addr);
            }

            let expected = if self.is_currently_applied {
                info.patch_bytes()
            } else {
                info.original_bytes()
            };

            if current != expected && mismatch.is_none() {
                mismatch = Some(info.addr);
            }

            if current != info.original_bytes() {
                all_original = false;
            }
        }

        match mismatch {
            None => Validation::Consistent,
            Some(_) if self.is_currently_applied && all_original => Validation::NeedsApply,
            Some(addr) => {
                log::warn!("Guest bytes at {addr:#x} diverged from the patch state");
                Validation::Diverged(addr)
            }
        }
    }

    /// Returns `true` if every record holds the bytes expected for the current state
    #[must_use]
    pub fn validate_patches<M: GuestMemory>(&self, memory: &M) -> bool {
        matches!(self.validate(memory), Validation::Consistent)
    }

    /// Drop every record without touching guest memory. Restore first if the guest
    /// must be left unpatched.
    pub fn free(&mut self) {
        self.patches.clear();
        self.is_currently_applied = false;
    }
}
