//! Search-path rewriting for installed binaries.
//!
//! Binaries built inside the build tree carry a library search path that
//! points back into it (e.g. `@rpath/build`). After installation that entry
//! must name the absolute install directory instead. The rewrite happens in
//! place: the embedded string keeps its original slot and any bytes left
//! over are NUL-padded, so no offsets in the file move.
//!
//! Supported containers:
//!
//! - Mach-O, 32/64-bit, either byte order, and fat/universal files
//!   (`LC_RPATH` load commands, every slice patched).
//! - ELF, 32/64-bit, either byte order (`DT_RUNPATH` and `DT_RPATH`, whose
//!   value is a colon-separated list; each element is an entry).
//!
//! An entry is rewritten when it equals the placeholder or starts with
//! `placeholder/`, and is replaced by the target directory as a whole. In a
//! list, entries that end up naming the target more than once are collapsed
//! to the first occurrence.

mod elf;
mod macho;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

/// Errors from [`patch_bytes`] and [`patch_file`].
#[derive(Error, Debug)]
pub enum PatchError {
    /// Neither Mach-O nor ELF.
    #[error("Unrecognized binary format")]
    UnrecognizedFormat,

    /// A header, table, or string runs past the end of the file or is
    /// otherwise inconsistent.
    #[error("Malformed binary: {0}")]
    Malformed(String),

    /// No search-path entry matches the placeholder or the target.
    #[error("No search-path entry matching '{placeholder}' found")]
    EntryNotFound {
        /// Placeholder that was searched for.
        placeholder: String,
    },

    /// The rewritten value does not fit in the original record.
    #[error(
        "Search path '{value}' needs {needed} bytes but the record holds {capacity}; \
         relink with -headerpad_max_install_names or a longer placeholder"
    )]
    CapacityExceeded {
        /// Replacement value.
        value: String,
        /// Bytes required, including the terminator.
        needed: usize,
        /// Bytes available.
        capacity: usize,
    },

    /// Reading or writing the file failed.
    #[error("Failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

pub(crate) fn malformed(msg: impl Into<String>) -> PatchError {
    PatchError::Malformed(msg.into())
}

/// Result of a successful patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Entries were rewritten.
    Rewritten {
        /// Number of entries changed.
        entries: usize,
    },
    /// Every matching entry already names the target; nothing was written.
    AlreadyPatched,
}

/// Rewrite search-path entries in `buf` from `placeholder` to `target`.
///
/// On error `buf` is left unchanged.
///
/// # Errors
///
/// See [`PatchError`].
pub fn patch_bytes(buf: &mut [u8], placeholder: &str, target: &str) -> Result<PatchOutcome, PatchError> {
    let rewrite = Rewrite::new(placeholder, target);
    let records = if macho::is_macho(buf) {
        macho::search_path_records(buf)?
    } else if elf::is_elf(buf) {
        elf::search_path_records(buf)?
    } else {
        return Err(PatchError::UnrecognizedFormat);
    };
    rewrite.apply(buf, &records)
}

/// Patch the file at `path` in place.
///
/// The new contents are written to a temporary file in the same directory
/// and renamed over the original, carrying its permissions over. Nothing is
/// written for [`PatchOutcome::AlreadyPatched`].
///
/// # Errors
///
/// See [`PatchError`].
pub fn patch_file(path: &Path, placeholder: &str, target: &str) -> Result<PatchOutcome, PatchError> {
    let io_err = |action, source| PatchError::Io {
        action,
        path: path.to_path_buf(),
        source,
    };

    let mut buf = fs::read(path).map_err(|e| io_err("read", e))?;
    let outcome = patch_bytes(&mut buf, placeholder, target)?;
    if outcome == PatchOutcome::AlreadyPatched {
        debug!(path = %path.display(), "search path already patched");
        return Ok(outcome);
    }

    let permissions = fs::metadata(path).map_err(|e| io_err("stat", e))?.permissions();
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_err("create temp file for", e))?;
    tmp.write_all(&buf).map_err(|e| io_err("write", e))?;
    tmp.as_file().sync_all().map_err(|e| io_err("sync", e))?;
    fs::set_permissions(tmp.path(), permissions).map_err(|e| io_err("chmod", e))?;
    tmp.persist(path).map_err(|e| io_err("replace", e.error))?;

    info!(path = %path.display(), placeholder, target, ?outcome, "patched search path");
    Ok(outcome)
}

/// How the bytes of a record are split into entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// One path per record (`LC_RPATH`).
    Single,
    /// Colon-separated paths (`DT_RUNPATH`).
    List,
}

/// A NUL-terminated string slot inside the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Record {
    /// Offset of the first byte of the string.
    pub offset: usize,
    /// Bytes available for the string and its terminator.
    pub capacity: usize,
    pub kind: RecordKind,
}

impl Record {
    fn value<'b>(&self, buf: &'b [u8]) -> Result<&'b str, PatchError> {
        let end = self
            .offset
            .checked_add(self.capacity)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| malformed("search-path string out of bounds"))?;
        let slot = &buf[self.offset..end];
        let len = slot
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("search-path string is not NUL-terminated"))?;
        std::str::from_utf8(&slot[..len]).map_err(|_| malformed("search-path string is not UTF-8"))
    }
}

struct Rewrite<'a> {
    placeholder: &'a str,
    target: &'a str,
}

impl<'a> Rewrite<'a> {
    fn new(placeholder: &'a str, target: &'a str) -> Self {
        Self {
            placeholder: trim_slash(placeholder),
            target: trim_slash(target),
        }
    }

    fn is_target(&self, entry: &str) -> bool {
        under(entry, self.target).is_some()
    }

    /// The replacement for `entry`, if it points into the build tree.
    fn entry(&self, entry: &str) -> Option<&'a str> {
        if self.is_target(entry) {
            return None;
        }
        under(entry, self.placeholder).map(|_| self.target)
    }

    fn apply(&self, buf: &mut [u8], records: &[Record]) -> Result<PatchOutcome, PatchError> {
        let mut writes: Vec<(Record, String)> = Vec::new();
        let mut changed = 0;
        let mut seen_target = false;

        for record in records {
            let value = record.value(buf)?;
            let entries: Vec<&str> = match record.kind {
                RecordKind::Single => vec![value],
                RecordKind::List => value.split(':').collect(),
            };

            let mut record_changed = false;
            let mut rewritten: Vec<&str> = Vec::with_capacity(entries.len());
            for entry in entries {
                let new = if let Some(new) = self.entry(entry) {
                    record_changed = true;
                    changed += 1;
                    new
                } else {
                    seen_target |= self.is_target(entry);
                    entry
                };
                if new == self.target && rewritten.contains(&self.target) {
                    continue;
                }
                rewritten.push(new);
            }

            if record_changed {
                let new_value = rewritten.join(":");
                let needed = new_value.len() + 1;
                if needed > record.capacity {
                    return Err(PatchError::CapacityExceeded {
                        value: new_value,
                        needed,
                        capacity: record.capacity,
                    });
                }
                writes.push((*record, new_value));
            }
        }

        if changed == 0 {
            return if seen_target {
                Ok(PatchOutcome::AlreadyPatched)
            } else {
                Err(PatchError::EntryNotFound {
                    placeholder: self.placeholder.to_string(),
                })
            };
        }

        for (record, value) in writes {
            let slot = &mut buf[record.offset..record.offset + record.capacity];
            slot[..value.len()].copy_from_slice(value.as_bytes());
            slot[value.len()..].fill(0);
        }
        Ok(PatchOutcome::Rewritten { entries: changed })
    }
}

/// The part of `entry` after `prefix` if `entry` is `prefix` or lies under it.
fn under<'e>(entry: &'e str, prefix: &str) -> Option<&'e str> {
    let rest = entry.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn trim_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { path } else { trimmed }
}

/// Byte order of the binary being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

impl Endian {
    fn bytes<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], PatchError> {
        offset
            .checked_add(N)
            .and_then(|end| buf.get(offset..end))
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed(format!("truncated at offset {offset:#x}")))
    }

    pub fn u16(self, buf: &[u8], offset: usize) -> Result<u16, PatchError> {
        let b = Self::bytes::<2>(buf, offset)?;
        Ok(match self {
            Self::Little => u16::from_le_bytes(b),
            Self::Big => u16::from_be_bytes(b),
        })
    }

    pub fn u32(self, buf: &[u8], offset: usize) -> Result<u32, PatchError> {
        let b = Self::bytes::<4>(buf, offset)?;
        Ok(match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        })
    }

    pub fn u64(self, buf: &[u8], offset: usize) -> Result<u64, PatchError> {
        let b = Self::bytes::<8>(buf, offset)?;
        Ok(match self {
            Self::Little => u64::from_le_bytes(b),
            Self::Big => u64::from_be_bytes(b),
        })
    }

    /// Read a 32- or 64-bit word.
    pub fn word(self, buf: &[u8], offset: usize, wide: bool) -> Result<u64, PatchError> {
        if wide {
            self.u64(buf, offset)
        } else {
            self.u32(buf, offset).map(u64::from)
        }
    }
}

/// Convert a file offset or size read from a header.
pub(crate) fn to_usize(value: u64) -> Result<usize, PatchError> {
    usize::try_from(value).map_err(|_| malformed(format!("offset {value:#x} out of range")))
}
