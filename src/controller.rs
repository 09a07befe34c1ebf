//! Drives the [`Patcher`] from the redqueen work directory across fuzzing iterations
//!
//! The fuzzer writes the addresses of comparisons it wants neutralized to
//! `redqueen_patches.txt` in its work directory. The controller loads that list,
//! patches the guest before each execution slice, and re-applies the patches after
//! every snapshot reset.

use thiserror::Error;

use crate::addrs::{VirtAddr, Vcpu};
use crate::config::{self, Config};
use crate::memory::GuestMemory;
use crate::patcher::{self, Patcher, Skipped, Validation};
use crate::trace::TraceToggle;

use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the address list inside the work directory
const PATCHES_FILE: &str = "redqueen_patches.txt";

/// Custom errors the controller can throw
#[derive(Error, Debug)]
pub enum Error {
    /// Reading or writing a work directory file failed
    #[error("Failed to access {path:?}: {source}")]
    Io {
        /// File being accessed
        path: PathBuf,

        /// Underlying error
        source: std::io::Error,
    },

    /// The patch engine failed
    #[error(transparent)]
    Patcher(#[from] patcher::Error),
}

/// Parse an address list: one hexadecimal address per line with an optional `0x`
/// prefix. Blank lines and `#` comments are ignored. Malformed lines are logged and
/// skipped.
#[must_use]
pub fn parse_addresses(text: &str) -> Vec<VirtAddr> {
    let mut addrs = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();

        if line.is_empty() {
            continue;
        }

        match line.parse::<VirtAddr>() {
            Ok(addr) => addrs.push(addr),
            Err(err) => log::warn!(
                "Skipping malformed address on line {}: {line:?} ({err})",
                index + 1
            ),
        }
    }

    addrs
}

/// Read the address list at `path`
///
/// # Errors
///
/// * The file could not be read
pub fn parse_address_file(path: &Path) -> Result<Vec<VirtAddr>, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let addrs = parse_addresses(&text);
    log::info!("Loaded {} patch addresses from {path:?}", addrs.len());

    Ok(addrs)
}

/// Write `addrs` to `path` in the format read by [`parse_address_file`]
///
/// # Errors
///
/// * The file could not be written
pub fn write_address_file(path: &Path, addrs: &[VirtAddr]) -> Result<(), Error> {
    let io_err = |source: std::io::Error| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::create(path).map_err(io_err)?;

    let mut text = String::new();
    for addr in addrs {
        text.push_str(&format!("{addr:x}\n"));
    }

    file.write_all(text.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    Ok(())
}

/// Layout of one fuzzing instance's redqueen work directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    /// `<base>/redqueen_workdir_<id>`
    path: PathBuf,
}

impl Workdir {
    /// The work directory for instance `id` under `base`
    #[must_use]
    pub fn new(base: impl AsRef<Path>, id: u32) -> Self {
        Self {
            path: base.as_ref().join(format!("redqueen_workdir_{id}")),
        }
    }

    /// The work directory described by the configuration
    #[must_use]
    pub fn from_config(config: &config::Workdir) -> Self {
        Self::new(&config.base, config.id)
    }

    /// The work directory itself
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The address list of instructions to patch
    #[must_use]
    pub fn patches(&self) -> PathBuf {
        self.path.join(PATCHES_FILE)
    }

    /// Comparison operands logged by the redqueen tracer
    #[must_use]
    pub fn redqueen(&self) -> PathBuf {
        self.path.join("redqueen_results.txt")
    }

    /// Symbolic execution results
    #[must_use]
    pub fn symbolic(&self) -> PathBuf {
        self.path.join("symbolic_results.txt")
    }

    /// Decoded processor trace of the last run
    #[must_use]
    pub fn pt_trace(&self) -> PathBuf {
        self.path.join("pt_trace_results.txt")
    }

    /// Addresses allowed to be hooked
    #[must_use]
    pub fn whitelist(&self) -> PathBuf {
        self.path.join("breakpoint_white.txt")
    }

    /// Addresses never to be hooked
    #[must_use]
    pub fn blacklist(&self) -> PathBuf {
        self.path.join("breakpoint_black.txt")
    }

    /// Dump of the target's code region
    #[must_use]
    pub fn code_dump(&self) -> PathBuf {
        self.path.join("target_code_dump.txt")
    }

    /// Remove the per-run result files so the next run starts from empty results.
    /// Files that don't exist are ignored. The address lists are left alone.
    ///
    /// # Errors
    ///
    /// * A result file exists but could not be removed
    pub fn delete_result_files(&self) -> Result<(), Error> {
        for path in [self.redqueen(), self.symbolic(), self.pt_trace()] {
            match std::fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(Error::Io { path, source }),
            }
        }

        Ok(())
    }

    /// Create an empty work directory, removing any previous one
    ///
    /// # Errors
    ///
    /// * Failed to remove the old directory or create the new one
    pub fn init_dir(&self) -> Result<(), Error> {
        let io_err = |source: std::io::Error| Error::Io {
            path: self.path.clone(),
            source,
        };

        if self.path.exists() {
            std::fs::remove_dir_all(&self.path).map_err(io_err)?;
        }

        std::fs::create_dir_all(&self.path).map_err(io_err)
    }
}

/// Load the address list at `path`, record the instructions and patch them
///
/// # Errors
///
/// * The address list could not be read
/// * Restoring the previous patches or applying the new ones failed
pub fn enable_patches<M: GuestMemory>(
    patcher: &mut Patcher,
    memory: &mut M,
    path: &Path,
) -> Result<Vec<Skipped>, Error> {
    let addrs = parse_address_file(path)?;
    let skipped = patcher.set_addresses(memory, &addrs)?;
    patcher.apply_all(memory)?;

    log::info!("Enabled {} patches", patcher.len());

    Ok(skipped)
}

/// Restore the original bytes of every patched instruction
///
/// # Errors
///
/// * Writing any original bytes failed
pub fn disable_patches<M: GuestMemory>(patcher: &mut Patcher, memory: &mut M) -> Result<(), Error> {
    patcher.restore_all(memory)?;
    log::info!("Disabled {} patches", patcher.len());
    Ok(())
}

/// Owns the patch state of one guest context for the life of a fuzzing instance
#[derive(Debug)]
pub struct PatchController {
    /// The patch engine
    patcher: Patcher,

    /// Where the address list lives
    workdir: Workdir,
}

impl PatchController {
    /// Create a controller for `vcpu` using the given configuration
    ///
    /// # Errors
    ///
    /// * The patcher configuration is invalid
    pub fn new(vcpu: Vcpu, config: &Config) -> Result<Self, Error> {
        Ok(Self {
            patcher: Patcher::with_config(vcpu, &config.patcher)?,
            workdir: Workdir::from_config(&config.workdir),
        })
    }

    /// The patch engine
    #[must_use]
    pub fn patcher(&self) -> &Patcher {
        &self.patcher
    }

    /// The work directory
    #[must_use]
    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    /// Patch the addresses currently listed in the work directory
    ///
    /// # Errors
    ///
    /// * See [`enable_patches`]
    pub fn enable<M: GuestMemory>(&mut self, memory: &mut M) -> Result<Vec<Skipped>, Error> {
        let path = self.workdir.patches();
        enable_patches(&mut self.patcher, memory, &path)
    }

    /// Restore every patched instruction
    ///
    /// # Errors
    ///
    /// * See [`disable_patches`]
    pub fn disable<M: GuestMemory>(&mut self, memory: &mut M) -> Result<(), Error> {
        disable_patches(&mut self.patcher, memory)
    }

    /// Restore the current patches and load the address list again. Used when the
    /// list changed, or when the guest was relaunched without a snapshot restore.
    ///
    /// # Errors
    ///
    /// * Restoring the old patches or enabling the new ones failed
    pub fn reload<M: GuestMemory>(&mut self, memory: &mut M) -> Result<Vec<Skipped>, Error> {
        self.disable(memory)?;
        self.enable(memory)
    }

    /// Bring guest memory in line with the patch state before an execution slice.
    ///
    /// Patches reverted by a snapshot reset are re-applied.
    ///
    /// # Errors
    ///
    /// * Guest bytes diverged from both the patched and original bytes
    /// * Re-applying the patches failed
    pub fn prepare_iteration<M: GuestMemory>(&mut self, memory: &mut M) -> Result<(), Error> {
        match self.patcher.validate(memory) {
            Validation::Consistent => Ok(()),
            Validation::NeedsApply => {
                log::debug!("Re-applying {} patches after reset", self.patcher.len());
                self.patcher.apply_all(memory)?;
                Ok(())
            }
            Validation::Diverged(addr) => Err(patcher::Error::ValidationMismatch(addr).into()),
        }
    }

    /// Run one guest execution slice with the patches in place and processor trace
    /// enabled for the duration of `slice`
    ///
    /// # Errors
    ///
    /// * See [`PatchController::prepare_iteration`]. The slice is not run.
    pub fn run_slice<M, T, F, R>(
        &mut self,
        memory: &mut M,
        trace: &mut T,
        slice: F,
    ) -> Result<R, Error>
    where
        M: GuestMemory,
        T: TraceToggle,
        F: FnOnce(&mut M) -> R,
    {
        self.prepare_iteration(memory)?;

        let vcpu = self.patcher.vcpu();

        if !trace.vm_entry(vcpu) {
            log::debug!("Trace state unchanged on VM entry");
        }

        let res = slice(memory);

        if !trace.vm_exit(vcpu) {
            log::debug!("Trace state unchanged on VM exit");
        }

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{Cr3, PhysAddr};
    use crate::memory::Memory;

    const CR3: Cr3 = Cr3(0x1000);
    const VCPU: Vcpu = Vcpu::new(0, CR3);
    const CODE: VirtAddr = VirtAddr(0x40_1000);

    /// `cmp al, bl; cmp eax, 0x12345678; ret`
    const CODE_BYTES: [u8; 8] = [0x38, 0xd8, 0x3d, 0x78, 0x56, 0x34, 0x12, 0xc3];

    fn memory() -> Memory {
        let mut memory = Memory::zeroed(0x20_000);
        memory.set_next_avail_phys_page(PhysAddr(0x2000));
        memory.map_virt_addr_4k(CODE, CR3).unwrap();
        memory.write_bytes(CODE, &CODE_BYTES, VCPU).unwrap();
        memory.dirty_pages.clear();
        memory
    }

    fn controller(base: &Path) -> PatchController {
        let mut config = Config::default();
        config.workdir.base = base.to_path_buf();
        config.workdir.id = 7;

        let controller = PatchController::new(VCPU, &config).unwrap();
        controller.workdir().init_dir().unwrap();
        controller
    }

    fn read(memory: &Memory, addr: VirtAddr, size: usize) -> Vec<u8> {
        let mut bytes = vec![0; size];
        memory.read_bytes(addr, &mut bytes, VCPU).unwrap();
        bytes
    }

    /// Records every trace toggle
    #[derive(Default)]
    struct Recorder {
        events: Vec<&'static str>,
    }

    impl TraceToggle for Recorder {
        fn vm_entry(&mut self, _vcpu: Vcpu) -> bool {
            self.events.push("entry");
            true
        }

        fn vm_exit(&mut self, _vcpu: Vcpu) -> bool {
            self.events.push("exit");
            true
        }
    }

    #[test]
    fn address_list_format() {
        let addrs = parse_addresses(
            "# candidate hashes\n\
             401000\n\
             \n\
             0x401002   # checksum\n\
             not_an_address\n\
             \t7fff0000\n",
        );

        assert_eq!(
            addrs,
            vec![VirtAddr(0x40_1000), VirtAddr(0x40_1002), VirtAddr(0x7fff_0000)]
        );
    }

    #[test]
    fn address_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PATCHES_FILE);

        let addrs = vec![VirtAddr(0x40_1000), VirtAddr(0xffff_8000_0000_1234)];
        write_address_file(&path, &addrs).unwrap();

        assert_eq!(parse_address_file(&path).unwrap(), addrs);
    }

    #[test]
    fn missing_address_file() {
        let dir = tempfile::tempdir().unwrap();
        let res = parse_address_file(&dir.path().join("missing.txt"));
        assert!(matches!(res, Err(Error::Io { .. })));
    }

    #[test]
    fn workdir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path(), 1337);

        assert_eq!(workdir.path(), dir.path().join("redqueen_workdir_1337"));
        assert_eq!(
            workdir.patches(),
            dir.path().join("redqueen_workdir_1337/redqueen_patches.txt")
        );

        workdir.init_dir().unwrap();
        std::fs::write(workdir.patches(), "401000\n").unwrap();

        // Re-initializing clears stale lists
        workdir.init_dir().unwrap();
        assert!(workdir.path().is_dir());
        assert!(!workdir.patches().exists());
    }

    #[test]
    fn workdir_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path(), 0);
        let base = dir.path().join("redqueen_workdir_0");

        assert_eq!(workdir.redqueen(), base.join("redqueen_results.txt"));
        assert_eq!(workdir.symbolic(), base.join("symbolic_results.txt"));
        assert_eq!(workdir.pt_trace(), base.join("pt_trace_results.txt"));
        assert_eq!(workdir.whitelist(), base.join("breakpoint_white.txt"));
        assert_eq!(workdir.blacklist(), base.join("breakpoint_black.txt"));
        assert_eq!(workdir.code_dump(), base.join("target_code_dump.txt"));

        workdir.init_dir().unwrap();

        // Nothing to delete yet
        workdir.delete_result_files().unwrap();

        for path in [workdir.redqueen(), workdir.pt_trace(), workdir.patches()] {
            std::fs::write(path, "401000\n").unwrap();
        }

        workdir.delete_result_files().unwrap();

        assert!(!workdir.redqueen().exists());
        assert!(!workdir.pt_trace().exists());
        assert!(workdir.patches().exists());
    }

    #[test]
    fn enable_and_disable() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut memory = memory();
        let before = memory.as_bytes().to_vec();

        write_address_file(&controller.workdir().patches(), &[CODE, VirtAddr(0x50_0000)])
            .unwrap();

        let skipped = controller.enable(&mut memory).unwrap();
        assert_eq!(skipped.len(), 1);
        assert!(controller.patcher().is_applied());
        assert_eq!(read(&memory, CODE, 2), vec![0x38, 0xc0]);

        controller.disable(&mut memory).unwrap();
        assert!(!controller.patcher().is_applied());
        assert_eq!(memory.as_bytes(), &before[..]);
    }

    #[test]
    fn prepare_iteration_reapplies_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut memory = memory();
        let clean = memory.as_bytes().to_vec();

        write_address_file(&controller.workdir().patches(), &[CODE, VirtAddr(0x40_1002)])
            .unwrap();
        controller.enable(&mut memory).unwrap();

        memory.reset_dirty_pages(&clean).unwrap();
        assert_eq!(read(&memory, CODE, 2), vec![0x38, 0xd8]);

        controller.prepare_iteration(&mut memory).unwrap();
        assert_eq!(read(&memory, CODE, 2), vec![0x38, 0xc0]);
        assert_eq!(
            read(&memory, VirtAddr(0x40_1002), 5),
            vec![0x38, 0xc0, 0x90, 0x90, 0x90]
        );
        assert!(controller.patcher().validate_patches(&memory));
    }

    #[test]
    fn diverged_guest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut memory = memory();

        write_address_file(&controller.workdir().patches(), &[CODE]).unwrap();
        controller.enable(&mut memory).unwrap();

        // Self modifying guest code
        memory.write_bytes(CODE, &[0xcc], VCPU).unwrap();

        let mut trace = Recorder::default();
        let mut ran = false;
        let res = controller.run_slice(&mut memory, &mut trace, |_| ran = true);

        assert!(matches!(
            res,
            Err(Error::Patcher(patcher::Error::ValidationMismatch(addr))) if addr == CODE
        ));
        assert!(!ran);
        assert!(trace.events.is_empty());
    }

    #[test]
    fn run_slice_wraps_execution_in_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut memory = memory();
        let clean = memory.as_bytes().to_vec();

        write_address_file(&controller.workdir().patches(), &[CODE]).unwrap();
        controller.enable(&mut memory).unwrap();

        let mut trace = Recorder::default();

        for _ in 0..3 {
            let patched = controller
                .run_slice(&mut memory, &mut trace, |memory| read(memory, CODE, 2))
                .unwrap();
            assert_eq!(patched, vec![0x38, 0xc0]);

            memory.reset_dirty_pages(&clean).unwrap();
        }

        assert_eq!(
            trace.events,
            vec!["entry", "exit", "entry", "exit", "entry", "exit"]
        );
    }

    #[test]
    fn reload_picks_up_new_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = controller(dir.path());
        let mut memory = memory();

        write_address_file(&controller.workdir().patches(), &[CODE]).unwrap();
        controller.enable(&mut memory).unwrap();

        write_address_file(&controller.workdir().patches(), &[VirtAddr(0x40_1002)]).unwrap();
        controller.reload(&mut memory).unwrap();

        assert_eq!(controller.patcher().len(), 1);
        assert_eq!(read(&memory, CODE, 2), vec![0x38, 0xd8]);
        assert_eq!(read(&memory, VirtAddr(0x40_1002), 2), vec![0x38, 0xc0]);
    }
}
