//! Build-and-install pipeline for hearth packages.
//!
//! The pieces run in this order, driven by [`Orchestrator`]:
//! [`resolver`] → [`builder`] → [`installer`] → [`patcher`] → [`signer`].

pub mod builder;
pub mod installer;
pub mod lock;
pub mod orchestrator;
pub mod paths;
pub mod patcher;
pub mod process;
pub mod receipt;
pub mod reporter;
pub mod resolver;
pub mod signer;
pub mod source;

pub use builder::{BuildFailure, BuildInvoker, BuildTool, Conan, Script};
pub use installer::{InstallIoError, InstallLayout, Installer};
pub use lock::InstallLock;
pub use orchestrator::{InstallResult, Orchestrator, Stage, StageError};
pub use paths::*;
pub use patcher::{PatchError, PatchOutcome, patch_bytes, patch_file};
pub use process::CancelToken;
pub use receipt::InstallReceipt;
pub use reporter::{NullReporter, Reporter};
pub use resolver::{
    DependencySource, MemorySource, PathSource, ResolvedDependency, StoreSource,
    UnresolvedDependency, resolve,
};
pub use signer::{Codesign, SignError, SignTool, Unsigned};
pub use source::{FetchError, GitFetcher};
