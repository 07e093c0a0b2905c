//! Where the host keeps its files.
//!
//! ```text
//!   config   ~/.config/vcomputer/config.toml        ($XDG_CONFIG_HOME)
//!   data     ~/.local/share/vcomputer/               ($XDG_DATA_HOME)
//!              computer/<id>/   private computer roots
//!              images/          packed virtual images (JSON)
//!   logs     <data>/logs/        (~/Library/Logs/vcomputer on macOS)
//! ```
//!
//! `HostConfig::data_dir` overrides the data root; the layout below it is
//! the same either way.

use std::path::{Path, PathBuf};

use crate::computer::ComputerId;

pub const APP_NAME: &str = "vcomputer";
const COMPUTERS: &str = "computer";
const IMAGES: &str = "images";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl HostPaths {
    /// Resolve from `HOME` and the XDG variables. Creates nothing.
    pub fn resolve() -> Option<Self> {
        let home = PathBuf::from(std::env::var_os("HOME")?);
        let config = xdg("XDG_CONFIG_HOME").unwrap_or_else(|| home.join(".config")).join(APP_NAME);
        let data = data_base(&home).join(APP_NAME);
        let logs = log_dir(&home, &data);
        Some(Self { config, data, logs })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    pub fn images(&self) -> PathBuf {
        self.data.join(IMAGES)
    }
}

/// Private root of computer `id` below a data root.
pub fn computer_root(data: &Path, id: ComputerId) -> PathBuf {
    data.join(COMPUTERS).join(id.to_string())
}

fn xdg(var: &str) -> Option<PathBuf> {
    std::env::var_os(var).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(target_os = "macos")]
fn data_base(home: &Path) -> PathBuf {
    home.join("Library").join("Application Support")
}

#[cfg(not(target_os = "macos"))]
fn data_base(home: &Path) -> PathBuf {
    xdg("XDG_DATA_HOME").unwrap_or_else(|| home.join(".local").join("share"))
}

#[cfg(target_os = "macos")]
fn log_dir(home: &Path, _data: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn log_dir(_home: &Path, data: &Path) -> PathBuf {
    data.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_paths_are_namespaced() {
        let paths = HostPaths::resolve().expect("HOME should be set in tests");
        assert!(paths.config.ends_with(APP_NAME));
        assert!(paths.data.ends_with(APP_NAME));
        assert_eq!(paths.config_file().file_name().unwrap(), "config.toml");
        assert!(paths.images().starts_with(&paths.data));
    }

    #[test]
    fn computer_roots_are_per_id() {
        let data = Path::new("/srv/vc");
        assert_eq!(computer_root(data, 0), PathBuf::from("/srv/vc/computer/0"));
        assert_ne!(computer_root(data, 1), computer_root(data, 10));
    }
}
