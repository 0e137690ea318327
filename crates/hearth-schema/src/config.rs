//! Build configuration passed to the build tool.
//!
//! The set of keys is closed: the `[build]` table is deserialized with
//! `deny_unknown_fields`, and command-line overrides go through
//! [`BuildConfig::set`], which rejects anything it does not know. Nothing is
//! silently ignored.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every key accepted by [`BuildConfig::set`].
pub const KNOWN_KEYS: &[&str] = &["skip-tests", "output-folder", "build-type", "use-system-libs"];

/// Errors raised while validating build configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The key is not one of [`KNOWN_KEYS`].
    #[error("Unknown build option '{0}' (expected one of: skip-tests, output-folder, build-type, use-system-libs)")]
    UnknownKey(String),

    /// The value could not be parsed for the given key.
    #[error("Invalid value '{value}' for build option '{key}': {reason}")]
    InvalidValue {
        /// Option name.
        key: String,
        /// Value as written.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An override was not written as `key=value`.
    #[error("Build option override '{0}' must be written as key=value")]
    Malformed(String),
}

/// CMake-style build type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildType {
    /// Unoptimized build with debug info.
    #[serde(alias = "debug")]
    Debug,
    /// Optimized build.
    #[default]
    #[serde(alias = "release")]
    Release,
}

impl BuildType {
    /// Name as the build tool expects it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "Debug",
            Self::Release => "Release",
        }
    }
}

impl std::fmt::Display for BuildType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            other => Err(format!("expected Debug or Release, got '{other}'")),
        }
    }
}

/// Options handed to the build tool.
///
/// Defaults match a release build of a tool that links against system
/// libraries and skips its own test suite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BuildConfig {
    /// Skip the project's test step during the build.
    #[serde(default = "default_true")]
    pub skip_tests: bool,
    /// Output folder, relative to the source tree.
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,
    /// Debug or Release.
    #[serde(default)]
    pub build_type: BuildType,
    /// Prefer libraries already present on the system over vendored ones.
    #[serde(default = "default_true")]
    pub use_system_libs: bool,
}

fn default_true() -> bool {
    true
}

fn default_output_folder() -> PathBuf {
    PathBuf::from("build")
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            skip_tests: true,
            output_folder: default_output_folder(),
            build_type: BuildType::Release,
            use_system_libs: true,
        }
    }
}

impl BuildConfig {
    /// Set a single option by its kebab-case key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownKey`] for keys outside [`KNOWN_KEYS`]
    /// and [`ConfigError::InvalidValue`] if the value does not parse.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason,
        };

        match key {
            "skip-tests" => self.skip_tests = parse_bool(value).map_err(invalid)?,
            "use-system-libs" => self.use_system_libs = parse_bool(value).map_err(invalid)?,
            "build-type" => self.build_type = value.parse().map_err(invalid)?,
            "output-folder" => {
                let folder = PathBuf::from(value);
                check_output_folder(&folder).map_err(invalid)?;
                self.output_folder = folder;
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Apply a list of `key=value` overrides in order.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed, unknown, or invalid override.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<(), ConfigError> {
        for raw in overrides {
            let raw = raw.as_ref();
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(raw.to_string()))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the output folder is empty,
    /// absolute, or escapes the source tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_output_folder(&self.output_folder).map_err(|reason| ConfigError::InvalidValue {
            key: "output-folder".to_string(),
            value: self.output_folder.display().to_string(),
            reason,
        })
    }

    /// Directory, relative to the source tree, where the build tool leaves
    /// its products: `<output-folder>/build/<build-type>`.
    pub fn products_dir(&self) -> PathBuf {
        self.output_folder.join("build").join(self.build_type.as_str())
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

fn check_output_folder(folder: &Path) -> Result<(), String> {
    if folder.as_os_str().is_empty() {
        return Err("must not be empty".to_string());
    }
    for component in folder.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err("must not contain '..'".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("must be relative to the source tree".to_string());
            }
        }
    }
    Ok(())
}
