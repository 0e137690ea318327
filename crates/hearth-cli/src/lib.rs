//! hearth - build, install, relink and sign tools from source
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! # Directory Layout
//!
//! ```text
//! ~/.hearth/             # or $HEARTH_HOME
//! ├── config.toml        # optional defaults, see `config`
//! ├── prefix/
//! │   ├── bin/           # installed executables
//! │   └── Frameworks/    # installed frameworks
//! ├── store/             # pre-built dependencies: <name>/<version>/
//! ├── src/               # source checkouts
//! ├── logs/              # build-<name>-<timestamp>.log
//! └── receipts/          # <name>.json per installed package
//! ```

pub mod cmd;
pub mod config;
pub mod ui;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hearth")]
#[command(author, version, about = "hearth - build tools from source and install them self-contained")]
pub struct Cli {
    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a package from source and install it
    Install(InstallArgs),
    /// Show how a package's dependencies resolve, without building
    Resolve {
        /// Package description (TOML)
        package: PathBuf,
    },
    /// Validate a package description
    Check {
        /// Package description (TOML)
        package: PathBuf,
        /// Build option overrides to validate as well
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Rewrite a binary's framework search path in place
    Patch {
        /// Mach-O or ELF binary
        binary: PathBuf,
        /// Search-path entry to replace
        #[arg(long)]
        placeholder: String,
        /// Directory the entry should point at
        #[arg(long)]
        target: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Package description (TOML)
    pub package: PathBuf,

    /// Use an existing source tree instead of cloning [source].url
    #[arg(long, value_name = "DIR")]
    pub source: Option<PathBuf>,

    /// Install prefix (bin/ and Frameworks/ below it)
    #[arg(long, value_name = "DIR", env = "HEARTH_PREFIX")]
    pub prefix: Option<PathBuf>,

    /// Executable directory, overrides the prefix
    #[arg(long, value_name = "DIR")]
    pub bin_dir: Option<PathBuf>,

    /// Frameworks directory, overrides the prefix
    #[arg(long, value_name = "DIR")]
    pub frameworks_dir: Option<PathBuf>,

    /// Build option override, e.g. -o build-type=Debug (repeatable)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Kill the build after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}
