//! Subcommand implementations.

pub mod check;
pub mod install;
pub mod patch;
pub mod resolve;

use anyhow::{Context, Result};
use hearth_schema::PackageSpec;
use std::path::Path;

/// Read and validate a package description.
pub(crate) fn load_package(path: &Path) -> Result<PackageSpec> {
    PackageSpec::from_file(path).with_context(|| format!("Invalid package {}", path.display()))
}
