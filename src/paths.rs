//! Application directories for hyfervisor.
//!
//! - Config: `$XDG_CONFIG_HOME/hyfervisor/` or `~/.config/hyfervisor/`
//! - Logs:   `~/Library/Logs/hyfervisor/` on macOS, XDG data dir elsewhere
//!
//! VM bundles live wherever the user points them and are not managed here.

use std::path::{Path, PathBuf};

use tracing::debug;

const APP_NAME: &str = "hyfervisor";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config directory.
    pub config: PathBuf,
    /// Application logs.
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve from `HOME` and the XDG variables. Creates nothing.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let xdg_config = std::env::var("XDG_CONFIG_HOME").ok().map(PathBuf::from);
        let xdg_data = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from);
        Some(Self::resolve_from(
            &home,
            xdg_config.as_deref(),
            xdg_data.as_deref(),
        ))
    }

    pub fn resolve_from(home: &Path, xdg_config: Option<&Path>, xdg_data: Option<&Path>) -> Self {
        Self {
            config: resolve_config_dir(home, xdg_config),
            logs: resolve_log_dir(home, xdg_data),
        }
    }

    /// `config.toml` inside the config directory.
    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE_NAME)
    }

    /// Create the directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path, xdg_config: Option<&Path>) -> PathBuf {
    match xdg_config {
        Some(xdg) if !xdg.as_os_str().is_empty() => xdg.join(APP_NAME),
        _ => home.join(".config").join(APP_NAME),
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _xdg_data: Option<&Path>) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path, xdg_data: Option<&Path>) -> PathBuf {
    match xdg_data {
        Some(xdg) if !xdg.as_os_str().is_empty() => xdg.join(APP_NAME).join("logs"),
        _ => home.join(".local").join("share").join(APP_NAME).join("logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_under_home() {
        let paths = AppPaths::resolve_from(Path::new("/home/ada"), None, None);
        assert_eq!(paths.config, PathBuf::from("/home/ada/.config/hyfervisor"));
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/home/ada/.config/hyfervisor/config.toml")
        );
    }

    #[test]
    fn xdg_config_home_wins() {
        let paths =
            AppPaths::resolve_from(Path::new("/home/ada"), Some(Path::new("/xdg/config")), None);
        assert_eq!(paths.config, PathBuf::from("/xdg/config/hyfervisor"));
    }

    #[test]
    fn empty_xdg_is_ignored() {
        let paths = AppPaths::resolve_from(Path::new("/home/ada"), Some(Path::new("")), None);
        assert_eq!(paths.config, PathBuf::from("/home/ada/.config/hyfervisor"));
    }

    #[test]
    fn logs_are_app_scoped() {
        let paths = AppPaths::resolve_from(Path::new("/home/ada"), None, None);
        assert!(paths.logs.to_string_lossy().contains("hyfervisor"));
        assert!(paths.logs.starts_with("/home/ada"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths {
            config: tmp.path().join("config"),
            logs: tmp.path().join("logs"),
        };

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.logs.is_dir());
    }
}
