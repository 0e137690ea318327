use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What a build product is, which decides where it gets installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// A program; installed into the binary directory, patched and signed.
    Executable,
    /// A framework bundle or shared library directory; installed into the
    /// frameworks directory.
    SharedFramework,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executable => write!(f, "executable"),
            Self::SharedFramework => write!(f, "shared-framework"),
        }
    }
}

/// An artifact as declared in the package description (`[[artifacts]]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactDecl {
    /// File or directory name inside the build products directory.
    pub name: String,
    /// Kind of product.
    pub kind: ArtifactKind,
}

/// A concrete build product with both of its locations.
///
/// Ordering is by kind, then name, then paths, so a sorted list of artifacts
/// is a stable function of the package description and the layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Artifact {
    /// Kind of product.
    pub kind: ArtifactKind,
    /// File or directory name.
    pub name: String,
    /// Location inside the build tree.
    pub source: PathBuf,
    /// Location inside the install tree.
    pub destination: PathBuf,
}

impl Artifact {
    /// Whether this artifact is an executable.
    pub fn is_executable(&self) -> bool {
        self.kind == ArtifactKind::Executable
    }
}
