//! Install receipts.
//!
//! A receipt is written after every successful install and records what was
//! built, from where, and the SHA-256 of each installed executable as it was
//! after patching and signing.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use hearth_schema::{Artifact, ArtifactKind, BuildConfig, BuildType, PackageName, PackageSpec, Phase};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::resolver::ResolvedDependency;

/// Errors reading or writing a receipt.
#[derive(Error, Debug)]
pub enum ReceiptError {
    /// Filesystem failure.
    #[error("Receipt I/O error on {}: {source}", .path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The receipt is not valid JSON.
    #[error("Invalid receipt {}: {source}", .path.display())]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// One installed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptArtifact {
    /// Artifact name.
    pub name: String,
    /// Artifact kind.
    pub kind: ArtifactKind,
    /// Installed location.
    pub path: PathBuf,
    /// SHA-256 of the installed executable. Frameworks are not hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One dependency used by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDependency {
    /// Dependency name.
    pub name: PackageName,
    /// Version found, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Phase it was needed in.
    pub phase: Phase,
}

/// Record of one successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    /// Package name.
    pub package: PackageName,
    /// Source URL.
    pub source: String,
    /// Branch or revision, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    /// Build type used.
    pub build_type: BuildType,
    /// RFC 3339 timestamp.
    pub installed_at: String,
    /// Installed artifacts.
    pub artifacts: Vec<ReceiptArtifact>,
    /// Dependencies used.
    pub dependencies: Vec<ReceiptDependency>,
}

impl InstallReceipt {
    /// Build a receipt, hashing each installed executable. `config` is the
    /// configuration the package was actually built with.
    ///
    /// # Errors
    ///
    /// Returns an error if an installed executable cannot be read.
    pub fn new(
        spec: &PackageSpec,
        config: &BuildConfig,
        artifacts: &[Artifact],
        deps: &[ResolvedDependency],
    ) -> Result<Self, ReceiptError> {
        let artifacts = artifacts
            .iter()
            .map(|a| {
                let sha256 = if a.is_executable() {
                    Some(sha256_file(&a.destination)?)
                } else {
                    None
                };
                Ok(ReceiptArtifact {
                    name: a.name.clone(),
                    kind: a.kind,
                    path: a.destination.clone(),
                    sha256,
                })
            })
            .collect::<Result<Vec<_>, ReceiptError>>()?;

        Ok(Self {
            package: spec.name().clone(),
            source: spec.source().url.clone(),
            git_ref: spec.source().git_ref().map(str::to_string),
            build_type: config.build_type,
            installed_at: chrono::Utc::now().to_rfc3339(),
            artifacts,
            dependencies: deps
                .iter()
                .map(|d| ReceiptDependency {
                    name: d.name.clone(),
                    version: d.version.as_ref().map(ToString::to_string),
                    phase: d.phase,
                })
                .collect(),
        })
    }

    /// `<dir>/<package>.json`.
    pub fn path_in(dir: &Path, package: &PackageName) -> PathBuf {
        dir.join(format!("{package}.json"))
    }

    /// Write the receipt into `dir`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ReceiptError> {
        let io_err = |path: &Path, source| ReceiptError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let path = Self::path_in(dir, &self.package);
        let content = serde_json::to_string_pretty(self).map_err(|source| ReceiptError::Json {
            path: path.clone(),
            source,
        })?;
        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(|e| io_err(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Read a receipt back.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a valid receipt.
    pub fn load(path: &Path) -> Result<Self, ReceiptError> {
        let content = fs::read(path).map_err(|source| ReceiptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&content).map_err(|source| ReceiptError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Hex SHA-256 of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, ReceiptError> {
    let io_err = |source| ReceiptError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
