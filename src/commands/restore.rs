//! Execute the `restore` command

use anyhow::{Context, Result};

use super::apply::AppliedPatches;
use crate::patcher::{self, Patcher, Validation};
use crate::{cmdline, ProjectState};

/// Write the original bytes of previously applied patches back into the snapshot
pub(crate) fn run(project_state: &ProjectState, args: &cmdline::Restore) -> Result<()> {
    let applied_path = project_state.applied_patches();
    if !applied_path.exists() {
        return Err(cmdline::Error::NothingApplied(applied_path).into());
    }

    let data = std::fs::read_to_string(&applied_path)
        .with_context(|| format!("Failed to read {applied_path:?}"))?;
    let applied: AppliedPatches = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse {applied_path:?}"))?;

    let mut memory = project_state.memory()?;
    let mut patcher = Patcher::from_records(applied.vcpu, applied.patches, true);

    match patcher.validate(&memory) {
        Validation::Consistent => {}
        Validation::NeedsApply => log::info!("Snapshot already holds the original bytes"),
        Validation::Diverged(addr) if args.force => {
            log::warn!("Patch at {addr:#x} was modified since it was applied, restoring anyway");
        }
        Validation::Diverged(addr) => {
            return Err(patcher::Error::ValidationMismatch(addr))
                .context("Patched bytes changed since `apply`. Use --force to restore anyway");
        }
    }

    patcher.restore_all(&mut memory)?;
    memory.flush()?;

    std::fs::remove_file(&applied_path)
        .with_context(|| format!("Failed to remove {applied_path:?}"))?;

    log::info!("Restored {} patches", patcher.len());

    Ok(())
}
