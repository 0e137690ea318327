//! TOML package description parsing
//!
//! A package description declares identity, where the source lives, what it
//! depends on, how to build it and which products to install. See
//! [`PackageSpec::parse`] for the accepted layout.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::ArtifactDecl;
use crate::config::{BuildConfig, ConfigError};
use crate::dependency::{Dependency, DependencyError, Phase};
use crate::types::PackageName;

/// Errors that can occur when loading or parsing a package description.
#[derive(Error, Debug)]
pub enum PackageError {
    /// An I/O error occurred while reading a package file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be deserialized.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A dependency declaration is malformed.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// The `[build]` table is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The description parsed but is not internally consistent.
    #[error("Invalid package description: {0}")]
    Invalid(String),
}

/// Identity and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageInfo {
    /// Package name.
    pub name: PackageName,
    /// Short human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Project homepage.
    #[serde(default)]
    pub homepage: String,
    /// SPDX license identifier.
    #[serde(default)]
    pub license: String,
}

/// Where the source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    /// Repository URL.
    pub url: String,
    /// Exact revision to check out.
    #[serde(default)]
    pub revision: Option<String>,
    /// Branch to track when no revision is pinned.
    #[serde(default)]
    pub branch: Option<String>,
}

impl SourceSpec {
    /// The ref to check out: the pinned revision, else the branch.
    pub fn git_ref(&self) -> Option<&str> {
        self.revision.as_deref().or(self.branch.as_deref())
    }
}

/// Which external build tool drives the build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildSystem {
    /// Conan 2 (`conan build`) with a CMake layout.
    #[default]
    Conan,
    /// A shell script run with `/bin/sh -c`.
    Script {
        /// Script body.
        script: String,
    },
}

/// How the installed executable should find its frameworks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    /// Search-path entry written by the build tool that points into the
    /// build tree. Defaults to `@rpath/<output-folder>`.
    #[serde(default)]
    pub placeholder: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyLists {
    #[serde(default)]
    build: Vec<String>,
    #[serde(default)]
    runtime: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PackageFile {
    package: PackageInfo,
    source: SourceSpec,
    #[serde(default)]
    dependencies: DependencyLists,
    #[serde(default)]
    build_system: BuildSystem,
    #[serde(default)]
    build: BuildConfig,
    #[serde(default)]
    artifacts: Vec<ArtifactDecl>,
    #[serde(default)]
    link: LinkSpec,
}

/// A fully parsed, validated package description.
///
/// Fields are read through accessors only, so a loaded spec cannot change.
/// Build option overrides are carried in a separate [`BuildConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSpec {
    info: PackageInfo,
    source: SourceSpec,
    dependencies: Vec<Dependency>,
    build_system: BuildSystem,
    build: BuildConfig,
    artifacts: Vec<ArtifactDecl>,
    link: LinkSpec,
}

impl PackageSpec {
    /// Parse a package description from a TOML file on disk.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::Io` if the file cannot be read, otherwise the
    /// same errors as [`PackageSpec::parse`].
    pub fn from_file(path: &Path) -> Result<Self, PackageError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a package description from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `PackageError::Parse` for malformed TOML or unknown keys,
    /// `PackageError::Dependency` for bad dependency declarations,
    /// `PackageError::Config` for invalid build options, and
    /// `PackageError::Invalid` for inconsistent artifact declarations.
    pub fn parse(content: &str) -> Result<Self, PackageError> {
        let file: PackageFile = toml::from_str(content)?;

        if file.package.name.is_empty() {
            return Err(PackageError::Invalid("package name is empty".to_string()));
        }
        if file.source.revision.is_some() && file.source.branch.is_some() {
            return Err(PackageError::Invalid(
                "[source] sets both revision and branch".to_string(),
            ));
        }
        file.build.validate()?;

        let mut seen = HashSet::new();
        for artifact in &file.artifacts {
            let plain = Path::new(&artifact.name)
                .file_name()
                .is_some_and(|n| n == artifact.name.as_str());
            if !plain {
                return Err(PackageError::Invalid(format!(
                    "artifact name '{}' must be a plain file name",
                    artifact.name
                )));
            }
            if !seen.insert(artifact.name.as_str()) {
                return Err(PackageError::Invalid(format!(
                    "artifact '{}' is declared twice",
                    artifact.name
                )));
            }
        }

        let mut dependencies = Vec::new();
        for decl in &file.dependencies.build {
            dependencies.push(Dependency::parse(decl, Phase::BuildOnly)?);
        }
        for decl in &file.dependencies.runtime {
            dependencies.push(Dependency::parse(decl, Phase::Runtime)?);
        }

        Ok(Self {
            info: file.package,
            source: file.source,
            dependencies,
            build_system: file.build_system,
            build: file.build,
            artifacts: file.artifacts,
            link: file.link,
        })
    }

    /// Package name.
    pub fn name(&self) -> &PackageName {
        &self.info.name
    }

    /// Identity and provenance.
    pub fn info(&self) -> &PackageInfo {
        &self.info
    }

    /// Source location.
    pub fn source(&self) -> &SourceSpec {
        &self.source
    }

    /// Declared dependencies: build-only entries first, then runtime, each
    /// in declaration order.
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Build tool selection.
    pub fn build_system(&self) -> &BuildSystem {
        &self.build_system
    }

    /// Declared options for the build tool.
    pub fn build(&self) -> &BuildConfig {
        &self.build
    }

    /// Products to install.
    pub fn artifacts(&self) -> &[ArtifactDecl] {
        &self.artifacts
    }

    /// Search-path patch settings.
    pub fn link(&self) -> &LinkSpec {
        &self.link
    }

    /// Effective placeholder search-path entry for the declared build options.
    pub fn placeholder(&self) -> String {
        self.placeholder_for(&self.build)
    }

    /// Effective placeholder when building with `config`, which may differ
    /// from the declared options after command-line overrides.
    pub fn placeholder_for(&self, config: &BuildConfig) -> String {
        self.link.placeholder.clone().unwrap_or_else(|| {
            let folder = PathBuf::from("@rpath").join(&config.output_folder);
            folder.to_string_lossy().into_owned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use crate::config::BuildType;

    const METALCHAT: &str = r#"
[package]
name = "metalchat"
description = "Llama inference for Apple Silicon"
homepage = "https://metalchat.readthedocs.org"
license = "GPL-3.0-or-later"

[source]
url = "https://github.com/ybubnov/metalchat.git"
branch = "main"

[dependencies]
build = ["conan@2", "cmake", "ninja"]
runtime = ["openssl@3", "curl"]

[build]
skip-tests = true
output-folder = "build"
build-type = "Release"
use-system-libs = true

[[artifacts]]
name = "metalchat"
kind = "executable"

[[artifacts]]
name = "MetalChat.framework"
kind = "shared-framework"
"#;

    #[test]
    fn test_parse_full_description() {
        let spec = PackageSpec::parse(METALCHAT).unwrap();
        assert_eq!(spec.name(), "metalchat");
        assert_eq!(spec.info().license, "GPL-3.0-or-later");
        assert_eq!(spec.source().git_ref(), Some("main"));
        assert_eq!(spec.build_system(), &BuildSystem::Conan);
        assert_eq!(spec.build().build_type, BuildType::Release);

        let names: Vec<&str> = spec.dependencies().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["conan", "cmake", "ninja", "openssl", "curl"]);
        assert_eq!(spec.dependencies()[0].phase, Phase::BuildOnly);
        assert_eq!(spec.dependencies()[4].phase, Phase::Runtime);

        assert_eq!(spec.artifacts().len(), 2);
        assert_eq!(spec.artifacts()[1].kind, ArtifactKind::SharedFramework);
        assert_eq!(spec.placeholder(), "@rpath/build");
    }

    #[test]
    fn test_unknown_build_key_fails() {
        let content = METALCHAT.replace("use-system-libs = true", "use-system-libs = true\nccache = true");
        let err = PackageSpec::parse(&content).unwrap_err();
        assert!(matches!(err, PackageError::Parse(_)));
        assert!(err.to_string().contains("ccache"));
    }

    #[test]
    fn test_script_build_system() {
        let content = format!(
            "{METALCHAT}\n[build-system]\nkind = \"script\"\nscript = \"make install\"\n"
        );
        let spec = PackageSpec::parse(&content).unwrap();
        assert_eq!(
            spec.build_system(),
            &BuildSystem::Script {
                script: "make install".to_string()
            }
        );
    }

    #[test]
    fn test_custom_placeholder() {
        let content = format!("{METALCHAT}\n[link]\nplaceholder = \"@rpath/out/lib\"\n");
        let spec = PackageSpec::parse(&content).unwrap();
        assert_eq!(spec.placeholder(), "@rpath/out/lib");
    }

    #[test]
    fn test_revision_and_branch_conflict() {
        let content = METALCHAT.replace("branch = \"main\"", "branch = \"main\"\nrevision = \"abc123\"");
        assert!(matches!(
            PackageSpec::parse(&content),
            Err(PackageError::Invalid(_))
        ));
    }

    #[test]
    fn test_duplicate_artifact_rejected() {
        let content = format!("{METALCHAT}\n[[artifacts]]\nname = \"metalchat\"\nkind = \"executable\"\n");
        assert!(matches!(
            PackageSpec::parse(&content),
            Err(PackageError::Invalid(_))
        ));
    }

    #[test]
    fn test_artifact_path_rejected() {
        let content = METALCHAT.replace("name = \"metalchat\"\nkind", "name = \"../metalchat\"\nkind");
        assert!(matches!(
            PackageSpec::parse(&content),
            Err(PackageError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metalchat.toml");
        std::fs::write(&path, METALCHAT).unwrap();
        let spec = PackageSpec::from_file(&path).unwrap();
        assert_eq!(spec.name(), "metalchat");
    }
}
