//! Install command

use anyhow::{Context, Result};
use hearth_core::{
    CancelToken, DependencySource, GitFetcher, Orchestrator, PathSource, StoreSource,
    build_log_path, receipts_dir, src_dir,
};
use std::path::PathBuf;
use tracing::debug;

use super::load_package;
use crate::InstallArgs;
use crate::config::{LayoutFlags, Settings};
use crate::ui::{Console, Output};

/// Build and install one package.
pub async fn install(args: InstallArgs) -> Result<()> {
    let settings = Settings::load()?;
    let spec = load_package(&args.package)?;

    let mut config = spec.build().clone();
    config
        .apply_overrides(&args.overrides)
        .context("Invalid build option")?;

    let layout = settings.layout(LayoutFlags {
        prefix: args.prefix.as_deref(),
        bin_dir: args.bin_dir.as_deref(),
        frameworks_dir: args.frameworks_dir.as_deref(),
    })?;

    let cancel = CancelToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                Output::new().warning("Interrupted, stopping build...");
                cancel.cancel();
            }
        })
    };

    let source_dir = match args.source {
        Some(dir) => std::path::absolute(&dir)
            .with_context(|| format!("Cannot resolve {}", dir.display()))?,
        None => fetch_source(&spec, cancel.clone()).await?,
    };
    debug!(source = %source_dir.display(), "using source tree");

    let sources: Vec<Box<dyn DependencySource>> = vec![
        Box::new(StoreSource::new(settings.store_dir())),
        Box::new(PathSource),
    ];
    let name = spec.name().clone();
    let log_path = build_log_path(&settings.log_dir(), name.as_str());

    let orchestrator = Orchestrator::new(spec, source_dir, layout)
        .with_config(config)
        .with_sources(sources)
        .with_reporter(Console::new(name.as_str()))
        .with_log_path(&log_path)
        .with_receipt_dir(receipts_dir())
        .with_timeout(settings.build_timeout(args.timeout))
        .with_cancel(cancel);

    let result = tokio::task::spawn_blocking(move || orchestrator.run())
        .await
        .context("Install task panicked")?;
    ctrl_c.abort();

    match result.into_result() {
        Ok(_) => Ok(()),
        Err((stage, err)) => {
            Output::new().field("log", &log_path.display().to_string());
            Err(anyhow::Error::new(err).context(format!("Installing '{name}' failed during {stage}")))
        }
    }
}

async fn fetch_source(spec: &hearth_schema::PackageSpec, cancel: CancelToken) -> Result<PathBuf> {
    let source = spec.source().clone();
    let dest = GitFetcher::checkout_dir(&src_dir(), spec.name());
    Output::new().info(&format!("Fetching {}", source.url));

    tokio::task::spawn_blocking(move || GitFetcher::new().with_cancel(cancel).fetch(&source, &dest))
        .await
        .context("Fetch task panicked")?
        .context("Failed to fetch sources")
}
