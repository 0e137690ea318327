//! Patch command

use anyhow::{Context, Result};
use hearth_core::{PatchOutcome, patch_file};
use std::path::Path;

use crate::ui::Output;

/// Point `binary`'s framework search path at `target`.
pub fn patch(binary: &Path, placeholder: &str, target: &Path) -> Result<()> {
    let target = std::path::absolute(target)
        .with_context(|| format!("Cannot resolve {}", target.display()))?;
    let target = target.to_string_lossy();

    let outcome = patch_file(binary, placeholder, &target)
        .with_context(|| format!("Failed to patch {}", binary.display()))?;

    let output = Output::new();
    match outcome {
        PatchOutcome::Rewritten { entries } => {
            output.success(&format!("Rewrote {entries} search path(s) in {}", binary.display()));
        }
        PatchOutcome::AlreadyPatched => {
            output.info(&format!("{} already points at {target}", binary.display()));
        }
    }
    Ok(())
}
