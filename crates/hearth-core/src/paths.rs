use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Returns the hearth home directory, or None if the user's home cannot be resolved.
pub fn try_hearth_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var("HEARTH_HOME") {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".hearth"))
}

/// Returns the hearth home directory (`~/.hearth`), falling back to a
/// relative `.hearth` when no home directory can be determined.
pub fn hearth_home() -> PathBuf {
    try_hearth_home().unwrap_or_else(|| PathBuf::from(".hearth"))
}

/// User configuration file: ~/.hearth/config.toml
pub fn config_path() -> PathBuf {
    hearth_home().join("config.toml")
}

/// Default install prefix: ~/.hearth/prefix
pub fn default_prefix() -> PathBuf {
    hearth_home().join("prefix")
}

/// Dependency store: ~/.hearth/store
pub fn store_path() -> PathBuf {
    hearth_home().join("store")
}

/// Logs directory: ~/.hearth/logs
pub fn log_dir() -> PathBuf {
    hearth_home().join("logs")
}

/// Source checkouts: ~/.hearth/src
pub fn src_dir() -> PathBuf {
    hearth_home().join("src")
}

/// Install receipts: ~/.hearth/receipts
pub fn receipts_dir() -> PathBuf {
    hearth_home().join("receipts")
}

/// Generate a build log path for a package inside `log_dir`.
pub fn build_log_path(log_dir: &Path, package: &str) -> PathBuf {
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    log_dir.join(format!("build-{package}-{timestamp}.log"))
}
