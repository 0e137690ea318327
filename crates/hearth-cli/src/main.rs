//! hearth - build tools from source and install them self-contained

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hearth_cli::cmd;
use hearth_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; -v only lowers the default.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Install(args) => cmd::install::install(args).await,
        Commands::Resolve { package } => cmd::resolve::resolve(&package),
        Commands::Check { package, overrides } => cmd::check::check(&package, &overrides),
        Commands::Patch {
            binary,
            placeholder,
            target,
        } => cmd::patch::patch(&binary, &placeholder, &target),
    }
}
