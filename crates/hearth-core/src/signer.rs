//! Ad-hoc code signing.
//!
//! Patching a Mach-O binary invalidates its signature, and Apple Silicon
//! refuses to run unsigned code, so every patched executable is re-signed
//! with an ad-hoc identity (`codesign -s - -f`). Platforms without a
//! code-integrity gatekeeper use [`Unsigned`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::process::{CancelToken, CaptureError, WaitError, run_captured};

/// Upper bound for a single signing call.
const SIGN_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from a [`SignTool`].
#[derive(Error, Debug)]
pub enum SignError {
    /// The signing tool is not installed.
    #[error("'{tool}' not found. Please install Xcode Command Line Tools: xcode-select --install")]
    NotFound {
        /// Tool name.
        tool: String,
    },

    /// The tool could not be started or waited on.
    #[error("Failed to run '{tool}': {source}")]
    Io {
        /// Tool name.
        tool: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The tool ran and rejected the file.
    #[error("'{tool}' failed on {} (exit code {}): {output}", .path.display(), .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Failed {
        /// Tool name.
        tool: String,
        /// File being signed.
        path: PathBuf,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The tool did not finish in time.
    #[error("'{tool}' timed out after {}s", .after.as_secs())]
    TimedOut {
        /// Tool name.
        tool: String,
        /// Elapsed time.
        after: Duration,
    },

    /// The run was cancelled while signing.
    #[error("Signing cancelled")]
    Cancelled,
}

/// Something that can sign an installed binary in place.
pub trait SignTool: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sign `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`SignError`] if the file could not be signed.
    fn sign(&self, path: &Path, cancel: &CancelToken) -> Result<(), SignError>;
}

/// Apple's `codesign` with an ad-hoc identity.
#[derive(Debug, Clone)]
pub struct Codesign {
    program: PathBuf,
}

impl Default for Codesign {
    fn default() -> Self {
        Self {
            program: PathBuf::from("codesign"),
        }
    }
}

impl Codesign {
    /// Use a specific `codesign` executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SignTool for Codesign {
    fn name(&self) -> &str {
        "codesign"
    }

    fn sign(&self, path: &Path, cancel: &CancelToken) -> Result<(), SignError> {
        let tool = self.program.display().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(["-s", "-", "-f"]).arg(path);

        debug!(path = %path.display(), "codesign");
        let (status, output) = match run_captured(&mut cmd, Some(SIGN_TIMEOUT), cancel) {
            Ok(finished) => finished,
            Err(CaptureError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SignError::NotFound { tool });
            }
            Err(CaptureError::Spawn(source) | CaptureError::Output(source)) => {
                return Err(SignError::Io { tool, source });
            }
            Err(CaptureError::Wait(WaitError::TimedOut(after))) => {
                return Err(SignError::TimedOut { tool, after });
            }
            Err(CaptureError::Wait(WaitError::Cancelled)) => return Err(SignError::Cancelled),
            Err(CaptureError::Wait(WaitError::Io(source))) => {
                return Err(SignError::Io { tool, source });
            }
        };

        if !status.success() {
            return Err(SignError::Failed {
                tool,
                path: path.to_path_buf(),
                code: status.code(),
                output: output.trim().to_string(),
            });
        }

        info!(path = %path.display(), "signed (ad-hoc)");
        Ok(())
    }
}

/// Signing is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

impl SignTool for Unsigned {
    fn name(&self) -> &str {
        "unsigned"
    }

    fn sign(&self, path: &Path, _cancel: &CancelToken) -> Result<(), SignError> {
        debug!(path = %path.display(), "signing skipped on this platform");
        Ok(())
    }
}

/// `codesign` on macOS, [`Unsigned`] elsewhere.
pub fn platform_default() -> Box<dyn SignTool> {
    if cfg!(target_os = "macos") {
        Box::new(Codesign::default())
    } else {
        Box::new(Unsigned)
    }
}
