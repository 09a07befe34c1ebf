//! Command line arguments

use anyhow::{Context, Result};
use clap::Parser;
use thiserror::Error;

use std::path::{Path, PathBuf};

use crate::addrs::{Cr3, VirtAddr, Vcpu};
use crate::config::Config;
use crate::controller::{self, Workdir};
use crate::memory::Memory;

/// Custom errors the command line can throw
#[derive(Error, Debug)]
pub enum Error {
    /// Physical memory (.physmem file) missing from project dir
    #[error("Physical memory (.physmem file) missing from project dir")]
    PhysicalMemoryMissing,

    /// More than one physical memory file found in the project dir
    #[error("Multiple physical memory (.physmem) files found in project dir: {0:?}")]
    MultiplePhysicalMemory(Vec<PathBuf>),

    /// The command needs a page table root but none was given
    #[error("No CR3 given. Pass --cr3 to select the guest address space")]
    Cr3Missing,

    /// Patches were already applied to the snapshot
    #[error("Snapshot already has applied patches ({0:?}). Run `restore` first")]
    AlreadyApplied(PathBuf),

    /// No applied patches to restore
    #[error("No applied patches found ({0:?})")]
    NothingApplied(PathBuf),
}

/// The files associated with the snapshot state
#[derive(Debug)]
pub struct ProjectState {
    /// The path to this project
    pub(crate) path: PathBuf,

    /// Path to the physical memory backing of the snapshot
    pub(crate) physical_memory: Option<PathBuf>,

    /// The configuration settings for this project
    pub(crate) config: Config,
}

impl ProjectState {
    /// Map the physical memory of the snapshot as writable
    ///
    /// # Errors
    ///
    /// * The project has no physical memory file
    /// * Failed to map the physical memory file
    pub fn memory(&self) -> Result<Memory> {
        let path = self
            .physical_memory
            .as_ref()
            .ok_or(Error::PhysicalMemoryMissing)?;

        Memory::from_file(path)
    }

    /// Path to the record of patches applied to the snapshot
    #[must_use]
    pub fn applied_patches(&self) -> PathBuf {
        self.path.join(crate::APPLIED_PATCHES_FILE)
    }

    /// The configuration for this project
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Gather the project state from the given project directory
///
/// # Errors
///
/// * Failed to read the project directory
/// * Failed to parse `config.toml`
/// * More than one `.physmem` file exists
pub fn get_project_state(dir: &Path) -> Result<ProjectState> {
    let mut physical_memory = Vec::new();
    let mut config = Config::default();

    if !dir.exists() {
        log::warn!("Project directory {dir:?} does not exist");

        return Ok(ProjectState {
            path: dir.to_path_buf(),
            physical_memory: None,
            config,
        });
    }

    // Read the snapshot directory looking for the specific file extensions
    for file in dir
        .read_dir()
        .with_context(|| format!("Failed to read project dir {dir:?}"))?
    {
        let file = file?;

        // If we find a config file, use this config instead of the default
        if matches!(file.file_name().to_str(), Some("config.toml")) {
            let data = std::fs::read_to_string(file.path())?;
            config = toml::from_str(&data)
                .with_context(|| format!("Failed to parse {:?}", file.path()))?;
            log::debug!("Using project config: {config:#?}");
            continue;
        }

        if matches!(
            file.path().extension().and_then(|ext| ext.to_str()),
            Some("physmem")
        ) {
            physical_memory.push(file.path());
        }
    }

    if physical_memory.len() > 1 {
        physical_memory.sort();
        return Err(Error::MultiplePhysicalMemory(physical_memory).into());
    }

    Ok(ProjectState {
        path: dir.to_path_buf(),
        physical_memory: physical_memory.pop(),
        config,
    })
}

/// Patch guest comparison instructions in a memory snapshot
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CommandLineArgs {
    /// Path to the directory containing the target snapshot state (a `.physmem` file
    /// and an optional `config.toml`)
    #[clap(short, long, default_value = "./snapshot")]
    pub(crate) project: PathBuf,

    /// Verbosity to print information messages
    #[clap(flatten)]
    pub(crate) verbosity: clap_verbosity_flag::Verbosity,

    /// Page table root of the guest address space to patch
    #[clap(long, global = true)]
    pub(crate) cr3: Option<Cr3>,

    /// Index of the vCPU whose address space is patched
    #[clap(long, global = true, default_value_t = 0)]
    pub(crate) vcpu: u32,

    /// Command to execute
    #[clap(subcommand)]
    pub(crate) command: SubCommand,
}

impl CommandLineArgs {
    /// The vCPU selected on the command line
    ///
    /// # Errors
    ///
    /// * No `--cr3` was given
    pub fn vcpu(&self) -> Result<Vcpu, Error> {
        let cr3 = self.cr3.ok_or(Error::Cr3Missing)?;
        Ok(Vcpu::new(self.vcpu, cr3))
    }
}

/// Subcommands available for the command line
#[derive(Parser, Debug)]
pub enum SubCommand {
    /// Report which addresses can be patched without modifying the snapshot
    Check(Check),

    /// Patch the snapshot physical memory in place
    Apply(Apply),

    /// Restore the original bytes of previously applied patches
    Restore(Restore),

    /// Disassemble instructions at an address
    Disasm(Disasm),

    /// Parse an Intel syntax operand
    Operand(Operand),
}

/// Where to read the patch addresses from
#[derive(Parser, Debug, Clone)]
pub struct Addresses {
    /// Addresses to patch
    pub(crate) addrs: Vec<VirtAddr>,

    /// Address list with one hex address per line. Defaults to the address list in the
    /// configured redqueen work directory when no addresses are given.
    #[clap(short, long)]
    pub(crate) file: Option<PathBuf>,
}

impl Addresses {
    /// Resolve the addresses to patch
    ///
    /// # Errors
    ///
    /// * The address file could not be read
    pub fn resolve(&self, config: &Config) -> Result<Vec<VirtAddr>> {
        let mut addrs = self.addrs.clone();

        let file = match (&self.file, addrs.is_empty()) {
            (Some(file), _) => Some(file.clone()),
            (None, true) => Some(Workdir::from_config(&config.workdir).patches()),
            (None, false) => None,
        };

        if let Some(file) = file {
            addrs.extend(controller::parse_address_file(&file)?);
        }

        Ok(addrs)
    }
}

/// Check command
#[derive(Parser, Debug)]
pub struct Check {
    /// Addresses to check
    #[clap(flatten)]
    pub(crate) addresses: Addresses,
}

/// Apply command
#[derive(Parser, Debug)]
pub struct Apply {
    /// Addresses to patch
    #[clap(flatten)]
    pub(crate) addresses: Addresses,
}

/// Restore command
#[derive(Parser, Debug)]
pub struct Restore {
    /// Restore even if the patched bytes no longer match what was written
    #[clap(long)]
    pub(crate) force: bool,
}

/// Disasm command
#[derive(Parser, Debug)]
pub struct Disasm {
    /// Address to start disassembling from
    pub(crate) addr: VirtAddr,

    /// Number of instructions to disassemble
    #[clap(short = 'n', long, default_value_t = 10)]
    pub(crate) count: usize,

    /// Print the parsed operands of each instruction
    #[clap(long)]
    pub(crate) operands: bool,

    /// Print a hexdump of the bytes covered by the instructions
    #[clap(long)]
    pub(crate) hexdump: bool,
}

/// Operand command
#[derive(Parser, Debug)]
pub struct Operand {
    /// Operand text, for example `dword ptr [rax+rbx*4+0x10]`
    pub(crate) text: String,

    /// Operand to compare against
    #[clap(long)]
    pub(crate) compare: Option<String>,
}
