//! User defaults from `$HEARTH_HOME/config.toml`.
//!
//! Every key is optional. Command-line flags take precedence over the file,
//! and the file over the built-in locations under `$HEARTH_HOME`.
//!
//! ```toml
//! prefix = "/opt/tools"
//! frameworks_dir = "/opt/tools/Frameworks"
//! store_dir = "/opt/deps"
//! build_timeout_secs = 3600
//! ```

use anyhow::{Context, Result};
use hearth_core::InstallLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub prefix: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub frameworks_dir: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub build_timeout_secs: Option<u64>,
}

/// Directory overrides given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutFlags<'a> {
    pub prefix: Option<&'a Path>,
    pub bin_dir: Option<&'a Path>,
    pub frameworks_dir: Option<&'a Path>,
}

impl Settings {
    /// Load `config.toml` from the hearth home, or defaults if it is absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&hearth_core::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Install directories: flag, then file, then `<prefix>/bin` and
    /// `<prefix>/Frameworks`. Relative paths are taken from the current
    /// directory.
    pub fn layout(&self, flags: LayoutFlags<'_>) -> Result<InstallLayout> {
        let prefix = flags
            .prefix
            .map(Path::to_path_buf)
            .or_else(|| self.prefix.clone())
            .unwrap_or_else(hearth_core::default_prefix);
        let prefix = absolute(&prefix)?;
        let defaults = InstallLayout::under_prefix(&prefix)?;

        let bin_dir = match flags.bin_dir.map(Path::to_path_buf).or_else(|| self.bin_dir.clone()) {
            Some(dir) => absolute(&dir)?,
            None => defaults.bin_dir().to_path_buf(),
        };
        let frameworks_dir = match flags
            .frameworks_dir
            .map(Path::to_path_buf)
            .or_else(|| self.frameworks_dir.clone())
        {
            Some(dir) => absolute(&dir)?,
            None => defaults.frameworks_dir().to_path_buf(),
        };
        Ok(InstallLayout::new(bin_dir, frameworks_dir)?)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(hearth_core::store_path)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(hearth_core::log_dir)
    }

    /// Build timeout: flag, then file. `None` means no limit.
    pub fn build_timeout(&self, flag: Option<u64>) -> Option<Duration> {
        flag.or(self.build_timeout_secs).map(Duration::from_secs)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Cannot resolve {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_parse_all_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
prefix = "/opt/tools"
bin_dir = "/usr/local/bin"
frameworks_dir = "/opt/fw"
store_dir = "/opt/deps"
log_dir = "/var/log/hearth"
build_timeout_secs = 90
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.prefix.as_deref(), Some(Path::new("/opt/tools")));
        assert_eq!(settings.store_dir(), PathBuf::from("/opt/deps"));
        assert_eq!(settings.log_dir(), PathBuf::from("/var/log/hearth"));
        assert_eq!(settings.build_timeout(None), Some(Duration::from_secs(90)));
        assert_eq!(settings.build_timeout(Some(5)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "prefx = \"/opt\"\n").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_layout_precedence() {
        let settings = Settings {
            prefix: Some(PathBuf::from("/opt/tools")),
            frameworks_dir: Some(PathBuf::from("/opt/fw")),
            ..Settings::default()
        };

        let layout = settings.layout(LayoutFlags::default()).unwrap();
        assert_eq!(layout.bin_dir(), Path::new("/opt/tools/bin"));
        assert_eq!(layout.frameworks_dir(), Path::new("/opt/fw"));

        let layout = settings
            .layout(LayoutFlags {
                prefix: Some(Path::new("/srv")),
                frameworks_dir: Some(Path::new("/srv/lib")),
                ..LayoutFlags::default()
            })
            .unwrap();
        assert_eq!(layout.bin_dir(), Path::new("/srv/bin"));
        assert_eq!(layout.frameworks_dir(), Path::new("/srv/lib"));
    }

    #[test]
    fn test_no_timeout_by_default() {
        assert_eq!(Settings::default().build_timeout(None), None);
    }
}
