//! Check command

use anyhow::{Context, Result};
use std::path::Path;

use super::load_package;
use crate::ui::Output;

/// Validate a package description and any overrides without building.
pub fn check(path: &Path, overrides: &[String]) -> Result<()> {
    let spec = load_package(path)?;
    let mut config = spec.build().clone();
    config
        .apply_overrides(overrides)
        .context("Invalid build option")?;

    let output = Output::new();
    output.success("Package is valid");
    output.field("name", spec.name().as_str());
    output.field("source", &spec.source().url);
    if let Some(git_ref) = spec.source().git_ref() {
        output.field("ref", git_ref);
    }
    output.field("build type", config.build_type.as_str());
    output.field("products", &config.products_dir().display().to_string());
    output.field("placeholder", &spec.placeholder_for(&config));

    for dep in spec.dependencies() {
        output.field(&dep.phase.to_string(), &dep.to_string());
    }
    for artifact in spec.artifacts() {
        output.field(&artifact.kind.to_string(), &artifact.name);
    }

    if spec.artifacts().is_empty() {
        output.warning("No [[artifacts]] declared; install will copy nothing");
    }
    Ok(())
}
