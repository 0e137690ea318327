//! Shared types for hearth package descriptions.
//!
//! Everything in this crate is plain data: a [`PackageSpec`] is loaded once
//! from TOML and never mutated afterwards. The orchestration logic that
//! consumes these types lives in `hearth-core`.

pub mod artifact;
pub mod config;
pub mod dependency;
pub mod package;
pub mod types;

// Re-exports
pub use artifact::{Artifact, ArtifactDecl, ArtifactKind};
pub use config::{BuildConfig, BuildType, ConfigError};
pub use dependency::{Dependency, DependencyError, Phase};
pub use package::{BuildSystem, LinkSpec, PackageError, PackageInfo, PackageSpec, SourceSpec};
pub use types::PackageName;
