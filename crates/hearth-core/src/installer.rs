//! Artifact installation.
//!
//! Installs are all-or-nothing. Each artifact is first copied to a hidden
//! staging path beside its destination, then every staged copy is renamed
//! into place. A JSON journal in the bin directory tracks every path the run
//! touches; on failure (or, if the process died, on the next run) the
//! journal is replayed to remove partial copies and restore whatever was
//! installed before.

use std::fs;
use std::path::{Path, PathBuf};

use hearth_schema::{Artifact, ArtifactKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Journal file name inside the bin directory.
pub const JOURNAL_FILE: &str = ".hearth-install.json";

const STAGING_SUFFIX: &str = ".hearth-partial";
const BACKUP_SUFFIX: &str = ".hearth-old";

/// Errors raised while placing artifacts in the install tree.
#[derive(Error, Debug)]
pub enum InstallIoError {
    /// Install directories must be absolute.
    #[error("Install directory must be an absolute path: {}", .0.display())]
    RelativeDestination(PathBuf),

    /// Another run holds the destination lock.
    #[error("Destination is locked by another install: {}", .path.display())]
    Locked {
        /// Lock file that could not be acquired.
        path: PathBuf,
    },

    /// A filesystem operation failed.
    #[error("Failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The journal could not be written or read back.
    #[error("Install journal {} is unreadable: {source}", .path.display())]
    Journal {
        /// Journal path.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

impl InstallIoError {
    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where each kind of artifact is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    bin_dir: PathBuf,
    frameworks_dir: PathBuf,
}

impl InstallLayout {
    /// Layout with explicit directories.
    ///
    /// # Errors
    ///
    /// Returns [`InstallIoError::RelativeDestination`] if either directory is
    /// relative; installed search paths must not depend on the working
    /// directory.
    pub fn new(
        bin_dir: impl Into<PathBuf>,
        frameworks_dir: impl Into<PathBuf>,
    ) -> Result<Self, InstallIoError> {
        let bin_dir = bin_dir.into();
        let frameworks_dir = frameworks_dir.into();
        for dir in [&bin_dir, &frameworks_dir] {
            if !dir.is_absolute() {
                return Err(InstallIoError::RelativeDestination(dir.clone()));
            }
        }
        Ok(Self {
            bin_dir,
            frameworks_dir,
        })
    }

    /// `<prefix>/bin` and `<prefix>/Frameworks`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallIoError::RelativeDestination`] for a relative prefix.
    pub fn under_prefix(prefix: &Path) -> Result<Self, InstallIoError> {
        Self::new(prefix.join("bin"), prefix.join("Frameworks"))
    }

    /// Executable destination directory.
    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Framework destination directory.
    pub fn frameworks_dir(&self) -> &Path {
        &self.frameworks_dir
    }

    /// Destination directory for `kind`.
    pub fn dir_for(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Executable => &self.bin_dir,
            ArtifactKind::SharedFramework => &self.frameworks_dir,
        }
    }

    /// Both destination directories, sorted and deduplicated.
    pub fn destinations(&self) -> Vec<&Path> {
        let mut dirs = vec![self.bin_dir.as_path(), self.frameworks_dir.as_path()];
        dirs.sort();
        dirs.dedup();
        dirs
    }

    fn journal_path(&self) -> PathBuf {
        self.bin_dir.join(JOURNAL_FILE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    staged: PathBuf,
    destination: PathBuf,
    #[serde(default)]
    backup: Option<PathBuf>,
    #[serde(default)]
    committed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    entries: Vec<JournalEntry>,
}

/// Copies artifacts into an [`InstallLayout`].
#[derive(Debug)]
pub struct Installer<'a> {
    layout: &'a InstallLayout,
}

impl<'a> Installer<'a> {
    /// Installer targeting `layout`.
    pub fn new(layout: &'a InstallLayout) -> Self {
        Self { layout }
    }

    /// Install every artifact or none of them.
    ///
    /// Existing destinations are replaced. On failure the install tree is
    /// returned to its prior state before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an [`InstallIoError`] for any copy, rename, or journal failure.
    pub fn install(&self, artifacts: &[Artifact]) -> Result<(), InstallIoError> {
        self.recover()?;

        for dir in self.layout.destinations() {
            fs::create_dir_all(dir).map_err(|e| InstallIoError::io("create", dir, e))?;
        }

        let mut journal = Journal::default();
        match self.stage_and_commit(artifacts, &mut journal) {
            Ok(()) => {
                for entry in &journal.entries {
                    if let Some(backup) = &entry.backup {
                        if let Err(e) = remove_path(backup) {
                            warn!(path = %backup.display(), error = %e, "failed to remove backup");
                        }
                    }
                }
                self.remove_journal()?;
                info!(count = artifacts.len(), "installed artifacts");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "install failed, rolling back");
                rollback(&journal);
                if let Err(journal_err) = self.remove_journal() {
                    warn!(error = %journal_err, "failed to remove install journal");
                }
                Err(e)
            }
        }
    }

    /// Replay a journal left by an interrupted run, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal exists but cannot be read or removed.
    pub fn recover(&self) -> Result<bool, InstallIoError> {
        let path = self.layout.journal_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(InstallIoError::io("read", &path, e)),
        };
        let journal: Journal = serde_json::from_slice(&content)
            .map_err(|source| InstallIoError::Journal { path: path.clone(), source })?;

        warn!(
            path = %path.display(),
            entries = journal.entries.len(),
            "found stale install journal, cleaning up"
        );
        rollback(&journal);
        self.remove_journal()?;
        Ok(true)
    }

    fn stage_and_commit(
        &self,
        artifacts: &[Artifact],
        journal: &mut Journal,
    ) -> Result<(), InstallIoError> {
        for artifact in artifacts {
            let staged = sibling(&artifact.destination, STAGING_SUFFIX);
            if staged.symlink_metadata().is_ok() {
                remove_path(&staged).map_err(|e| InstallIoError::io("remove", &staged, e))?;
            }
            // Record before copying so a crash mid-copy is still cleaned up.
            journal.entries.push(JournalEntry {
                staged: staged.clone(),
                destination: artifact.destination.clone(),
                backup: None,
                committed: false,
            });
            self.write_journal(journal)?;

            debug!(artifact = %artifact.name, staged = %staged.display(), "staging");
            copy_tree(&artifact.source, &staged)?;
        }

        for idx in 0..journal.entries.len() {
            let JournalEntry {
                staged,
                destination,
                ..
            } = journal.entries[idx].clone();

            if destination.symlink_metadata().is_ok() {
                let backup = sibling(&destination, BACKUP_SUFFIX);
                if backup.symlink_metadata().is_ok() {
                    remove_path(&backup).map_err(|e| InstallIoError::io("remove", &backup, e))?;
                }
                journal.entries[idx].backup = Some(backup.clone());
                self.write_journal(journal)?;
                fs::rename(&destination, &backup)
                    .map_err(|e| InstallIoError::io("move aside", &destination, e))?;
            }

            fs::rename(&staged, &destination)
                .map_err(|e| InstallIoError::io("commit", &destination, e))?;
            journal.entries[idx].committed = true;
            self.write_journal(journal)?;
            debug!(destination = %destination.display(), "committed");
        }

        Ok(())
    }

    fn write_journal(&self, journal: &Journal) -> Result<(), InstallIoError> {
        let path = self.layout.journal_path();
        let content = serde_json::to_vec_pretty(journal)
            .map_err(|source| InstallIoError::Journal { path: path.clone(), source })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| InstallIoError::io("write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| InstallIoError::io("write", &path, e))
    }

    fn remove_journal(&self) -> Result<(), InstallIoError> {
        let path = self.layout.journal_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstallIoError::io("remove", &path, e)),
        }
    }
}

/// Undo everything recorded in `journal`, newest first. Best effort.
fn rollback(journal: &Journal) {
    for entry in journal.entries.iter().rev() {
        if entry.committed {
            if let Err(e) = remove_path(&entry.destination) {
                warn!(path = %entry.destination.display(), error = %e, "rollback: remove failed");
            }
        }
        if let Err(e) = remove_path(&entry.staged) {
            warn!(path = %entry.staged.display(), error = %e, "rollback: remove failed");
        }
        if let Some(backup) = &entry.backup {
            if backup.symlink_metadata().is_ok() && entry.destination.symlink_metadata().is_err() {
                if let Err(e) = fs::rename(backup, &entry.destination) {
                    warn!(path = %backup.display(), error = %e, "rollback: restore failed");
                }
            }
        }
    }
}

/// `<dir>/.<name><suffix>` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{suffix}"))
}

/// Remove a file, symlink, or directory tree. Missing paths are not an error.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy `src` to `dst`, recursing into directories.
///
/// Symlinks are recreated rather than followed, and file and directory
/// permissions are carried over.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), InstallIoError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            InstallIoError::io("read", &path, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|e| InstallIoError::io("read link", entry.path(), e))?;
            symlink(&link, &target).map_err(|e| InstallIoError::io("link", &target, e))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| InstallIoError::io("create", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| InstallIoError::io("copy", entry.path(), e))?;
        }
    }

    // Directory permissions last so a read-only directory can still be filled.
    for entry in WalkDir::new(src).follow_links(false).contents_first(true) {
        let entry = entry.map_err(|e| InstallIoError::io("read", src, e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dst.join(relative);
        let perms = entry
            .metadata()
            .map_err(|e| InstallIoError::io("stat", entry.path(), e.into()))?
            .permissions();
        fs::set_permissions(&target, perms)
            .map_err(|e| InstallIoError::io("chmod", &target, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    let target = link.parent().map_or_else(|| original.to_path_buf(), |p| p.join(original));
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}
