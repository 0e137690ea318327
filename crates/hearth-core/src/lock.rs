//! Exclusive advisory locks on install destinations.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::installer::InstallIoError;

/// Lock file name created inside each destination directory.
pub const LOCK_FILE: &str = ".hearth.lock";

/// Holds `.hearth.lock` in every destination directory until dropped.
#[derive(Debug)]
pub struct InstallLock {
    _files: Vec<File>,
    paths: Vec<PathBuf>,
}

impl InstallLock {
    /// Lock every directory in `dirs`, creating them as needed.
    ///
    /// Directories are locked in sorted order with duplicates removed, so two
    /// runs over overlapping destinations cannot deadlock. The lock is
    /// non-blocking: a directory already held by another run fails
    /// immediately and releases anything acquired so far.
    ///
    /// # Errors
    ///
    /// Returns [`InstallIoError::Locked`] on contention, or
    /// [`InstallIoError::Io`] if a directory or lock file cannot be created.
    pub fn acquire<P: AsRef<Path>>(dirs: &[P]) -> Result<Self, InstallIoError> {
        let mut sorted: Vec<&Path> = dirs.iter().map(AsRef::as_ref).collect();
        sorted.sort();
        sorted.dedup();

        let mut files = Vec::with_capacity(sorted.len());
        let mut paths = Vec::with_capacity(sorted.len());
        for dir in sorted {
            fs::create_dir_all(dir).map_err(|e| InstallIoError::io("create", dir, e))?;

            let lock_path = dir.join(LOCK_FILE);
            // Never unlink the lock file: a second process could then lock a
            // fresh inode at the same path.
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| InstallIoError::io("open lock", &lock_path, e))?;

            if file.try_lock_exclusive().is_err() {
                return Err(InstallIoError::Locked { path: lock_path });
            }
            debug!(path = %lock_path.display(), "acquired install lock");
            files.push(file);
            paths.push(lock_path);
        }

        Ok(Self {
            _files: files,
            paths,
        })
    }

    /// Lock files held, in acquisition order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}
