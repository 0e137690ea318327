//! Resolve command

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use hearth_core::{DependencySource, PathSource, StoreSource};
use std::path::Path;

use super::load_package;
use crate::config::Settings;
use crate::ui::Output;

/// Print the resolved build order for a package's dependencies.
pub fn resolve(path: &Path) -> Result<()> {
    let settings = Settings::load()?;
    let spec = load_package(path)?;

    let store = StoreSource::new(settings.store_dir());
    let sources: [&dyn DependencySource; 2] = [&store, &PathSource];
    let resolved = hearth_core::resolve(&spec, &sources)
        .with_context(|| format!("Cannot resolve dependencies of '{}'", spec.name()))?;

    let output = Output::new();
    if resolved.is_empty() {
        output.success(&format!("{} has no dependencies", spec.name()));
        return Ok(());
    }

    output.success(&format!("{} dependencies resolved", resolved.len()));
    for dep in &resolved {
        let version = dep
            .version
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        println!(
            "    {}{:<12}{:<12}{}",
            format!("{:<16}", dep.name.as_str()).bold(),
            version,
            dep.phase.to_string(),
            dep.source.as_str().dark_grey()
        );
    }
    Ok(())
}
