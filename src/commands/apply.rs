//! Execute the `apply` command

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::patcher::{PatchInfo, Patcher};
use crate::{cmdline, ProjectState, Vcpu};

/// Patches written into a snapshot, saved so they can be restored later
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AppliedPatches {
    /// The vCPU whose address space was patched
    pub(crate) vcpu: Vcpu,

    /// The patched instructions and their original bytes
    pub(crate) patches: Vec<PatchInfo>,
}

/// Patch the snapshot physical memory in place
pub(crate) fn run(project_state: &ProjectState, vcpu: Vcpu, args: &cmdline::Apply) -> Result<()> {
    let applied_path = project_state.applied_patches();
    if applied_path.exists() {
        return Err(cmdline::Error::AlreadyApplied(applied_path).into());
    }

    let config = project_state.config();
    let addrs = args.addresses.resolve(config)?;

    let mut memory = project_state.memory()?;
    let mut patcher = Patcher::with_config(vcpu, &config.patcher)?;

    let skipped = patcher.set_addresses(&mut memory, &addrs)?;
    if patcher.is_empty() {
        log::warn!("None of the {} addresses can be patched", addrs.len());
        return Ok(());
    }

    patcher.apply_all(&mut memory)?;

    let applied = AppliedPatches {
        vcpu,
        patches: patcher.records().cloned().collect(),
    };

    let written = serde_json::to_string_pretty(&applied)
        .context("Failed to serialize applied patches")
        .and_then(|json| {
            std::fs::write(&applied_path, json)
                .with_context(|| format!("Failed to write {applied_path:?}"))
        });

    // Without the record the patches could never be restored
    if let Err(err) = written {
        patcher.restore_all(&mut memory)?;
        memory.flush()?;
        return Err(err);
    }

    memory.flush()?;

    log::info!(
        "Applied {} patches ({} skipped). Originals saved to {applied_path:?}",
        patcher.len(),
        skipped.len()
    );

    Ok(())
}
