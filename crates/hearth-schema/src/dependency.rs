//! Dependency declarations.
//!
//! The textual form is `name` or `name@requirement`, where the requirement is
//! any [`semver::VersionReq`]. A bare major version such as `openssl@3` is a
//! caret requirement (`^3`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PackageName;

/// When a dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Needed only while building (compilers, generators, build drivers).
    /// Never part of the installed artifact's runtime link set.
    BuildOnly,
    /// Linked into, or loaded by, the installed artifact.
    Runtime,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuildOnly => write!(f, "build-only"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

/// Errors raised while parsing a dependency declaration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DependencyError {
    /// The declaration had no name before the `@`.
    #[error("Dependency declaration '{0}' has an empty name")]
    EmptyName(String),

    /// The part after `@` is not a valid semver requirement.
    #[error("Invalid version requirement in '{decl}': {reason}")]
    InvalidRequirement {
        /// The full declaration as written.
        decl: String,
        /// Parser message.
        reason: String,
    },
}

/// A single declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Normalized dependency name.
    pub name: PackageName,
    /// Optional version constraint.
    pub requirement: Option<semver::VersionReq>,
    /// When the dependency is needed.
    pub phase: Phase,
}

impl Dependency {
    /// Parse `name` or `name@requirement` for the given phase.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError`] if the name is empty or the requirement
    /// does not parse.
    pub fn parse(decl: &str, phase: Phase) -> Result<Self, DependencyError> {
        let decl = decl.trim();
        let (name, req) = match decl.split_once('@') {
            Some((name, req)) => (name, Some(req.trim())),
            None => (decl, None),
        };

        if name.trim().is_empty() {
            return Err(DependencyError::EmptyName(decl.to_string()));
        }

        let requirement = match req {
            None | Some("" | "*" | "latest") => None,
            Some(req) => Some(semver::VersionReq::parse(req).map_err(|e| {
                DependencyError::InvalidRequirement {
                    decl: decl.to_string(),
                    reason: e.to_string(),
                }
            })?),
        };

        Ok(Self {
            name: PackageName::new(name),
            requirement,
            phase,
        })
    }

    /// Whether `version` satisfies this dependency's constraint.
    ///
    /// A dependency without a constraint accepts anything, including sources
    /// that cannot report a version at all.
    pub fn accepts(&self, version: Option<&semver::Version>) -> bool {
        match (&self.requirement, version) {
            (None, _) => true,
            (Some(req), Some(v)) => req.matches(v),
            (Some(_), None) => false,
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.requirement {
            Some(req) => write!(f, "{}@{req}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let dep = Dependency::parse("cmake", Phase::BuildOnly).unwrap();
        assert_eq!(dep.name, "cmake");
        assert!(dep.requirement.is_none());
        assert_eq!(dep.phase, Phase::BuildOnly);
    }

    #[test]
    fn test_parse_major_requirement() {
        let dep = Dependency::parse("openssl@3", Phase::Runtime).unwrap();
        assert_eq!(dep.name, "openssl");
        assert!(dep.accepts(Some(&semver::Version::new(3, 2, 1))));
        assert!(!dep.accepts(Some(&semver::Version::new(1, 1, 1))));
        assert!(!dep.accepts(None));
    }

    #[test]
    fn test_parse_range_requirement() {
        let dep = Dependency::parse("cmake@>=3.20, <5", Phase::BuildOnly).unwrap();
        assert!(dep.accepts(Some(&semver::Version::new(4, 1, 0))));
        assert!(!dep.accepts(Some(&semver::Version::new(3, 10, 0))));
    }

    #[test]
    fn test_latest_means_unconstrained() {
        let dep = Dependency::parse("curl@latest", Phase::Runtime).unwrap();
        assert!(dep.requirement.is_none());
        assert!(dep.accepts(None));
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(matches!(
            Dependency::parse("@3", Phase::Runtime),
            Err(DependencyError::EmptyName(_))
        ));
    }

    #[test]
    fn test_bad_requirement_rejected() {
        assert!(matches!(
            Dependency::parse("curl@not-a-version", Phase::Runtime),
            Err(DependencyError::InvalidRequirement { .. })
        ));
    }
}
