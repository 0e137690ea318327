//! Source checkout.
//!
//! When no local tree is supplied the declared git URL is fetched into the
//! state directory. Branches are shallow-cloned; pinned revisions are
//! fetched by hash at depth 1 and checked out detached.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use hearth_schema::{PackageName, SourceSpec};
use thiserror::Error;
use tracing::{debug, info};

use crate::process::{CancelToken, CaptureError, run_captured};

/// Upper bound for each git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Errors while checking out sources.
#[derive(Error, Debug)]
pub enum FetchError {
    /// `git` is not on `PATH`.
    #[error("'git' not found on PATH")]
    GitNotFound,

    /// A git command failed.
    #[error("git {step} failed for {url}:\n{output}")]
    Git {
        /// Which step failed.
        step: &'static str,
        /// Source URL.
        url: String,
        /// Captured output, or the reason no output exists.
        output: String,
    },

    /// The checkout directory could not be prepared.
    #[error("Failed to prepare checkout directory {}: {source}", .path.display())]
    Io {
        /// Directory involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Fetches package sources with `git`.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    program: PathBuf,
    cancel: CancelToken,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
            cancel: CancelToken::new(),
        }
    }
}

impl GitFetcher {
    /// Fetcher using `git` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `git` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Abort fetches when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Checkout location for `package` under `src_root`.
    pub fn checkout_dir(src_root: &Path, package: &PackageName) -> PathBuf {
        src_root.join(package.as_str())
    }

    /// Fetch `source` into `dest`, replacing anything already there.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] if `git` is missing or any step fails.
    pub fn fetch(&self, source: &SourceSpec, dest: &Path) -> Result<PathBuf, FetchError> {
        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        if dest.exists() {
            debug!(path = %dest.display(), "removing previous checkout");
            std::fs::remove_dir_all(dest).map_err(io_err)?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        info!(url = %source.url, git_ref = ?source.git_ref(), dest = %dest.display(), "fetching source");
        match (&source.branch, &source.revision) {
            (_, Some(revision)) => {
                std::fs::create_dir_all(dest).map_err(io_err)?;
                self.git(source, "init", dest, &["init", "--quiet"])?;
                self.git(source, "remote add", dest, &["remote", "add", "origin", &source.url])?;
                self.git(
                    source,
                    "fetch",
                    dest,
                    &["fetch", "--quiet", "--depth", "1", "origin", revision],
                )?;
                self.git(source, "checkout", dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])?;
            }
            (branch, None) => {
                let dest_arg = dest.to_string_lossy();
                let mut args = vec!["clone", "--quiet", "--depth", "1"];
                if let Some(branch) = branch {
                    args.extend(["--branch", branch.as_str()]);
                }
                args.extend([source.url.as_str(), &*dest_arg]);
                let cwd = dest.parent().unwrap_or(Path::new("."));
                self.git(source, "clone", cwd, &args)?;
            }
        }
        Ok(dest.to_path_buf())
    }

    fn git(&self, source: &SourceSpec, step: &'static str, cwd: &Path, args: &[&str]) -> Result<(), FetchError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0");

        let failed = |output: String| FetchError::Git {
            step,
            url: source.url.clone(),
            output,
        };
        match run_captured(&mut cmd, Some(GIT_TIMEOUT), &self.cancel) {
            Ok((status, _)) if status.success() => Ok(()),
            Ok((_, output)) => Err(failed(output.trim().to_string())),
            Err(CaptureError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::GitNotFound)
            }
            Err(e) => Err(failed(e.to_string())),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn have_git() -> bool {
        which::which("git").is_ok()
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    fn upstream(dir: &Path) -> String {
        let repo = dir.join("upstream");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet", "--initial-branch=main"]);
        std::fs::write(repo.join("conanfile.py"), "# recipe").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "--quiet", "-m", "init"]);
        format!("file://{}", repo.display())
    }

    fn spec(url: String, branch: Option<&str>) -> SourceSpec {
        SourceSpec {
            url,
            revision: None,
            branch: branch.map(str::to_string),
        }
    }

    #[test]
    fn test_clone_branch() {
        if !have_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let url = upstream(dir.path());
        let dest = dir.path().join("src/metalchat");

        GitFetcher::new().fetch(&spec(url, Some("main")), &dest).unwrap();
        assert!(dest.join("conanfile.py").is_file());
    }

    #[test]
    fn test_refetch_replaces_checkout() {
        if !have_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let url = upstream(dir.path());
        let dest = dir.path().join("src/metalchat");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale"), "x").unwrap();

        GitFetcher::new().fetch(&spec(url, None), &dest).unwrap();
        assert!(!dest.join("stale").exists());
        assert!(dest.join("conanfile.py").is_file());
    }

    #[test]
    fn test_unknown_branch_fails() {
        if !have_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let url = upstream(dir.path());
        let err = GitFetcher::new()
            .fetch(&spec(url, Some("no-such-branch")), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, FetchError::Git { step: "clone", .. }));
    }

    #[test]
    fn test_missing_git() {
        let dir = tempdir().unwrap();
        let err = GitFetcher::new()
            .with_program(dir.path().join("no-git"))
            .fetch(&spec("file:///nowhere".into(), None), &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, FetchError::GitNotFound));
    }
}
