//! Host configuration.
//!
//! Every section is `#[serde(default)]`, so a TOML file only needs the keys
//! it changes:
//!
//! ```toml
//! abort_timeout_ms = 10000
//! rom_dir = "/usr/share/vcomputer/rom"
//!
//! [[mounts]]
//! comp_path = "share"
//! backing = "/srv/share"
//! read_only = true
//!
//! [remote]
//! binary_checksum = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::computer::ComputerId;
use crate::paths::{self, HostPaths};
use crate::router::RouterOptions;

/// Timeout used in standards mode regardless of `abort_timeout_ms`.
pub const STANDARDS_TIMEOUT: Duration = Duration::from_millis(7000);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Milliseconds a guest may run without yielding.
    pub abort_timeout_ms: u64,
    /// Kill runaway guests outright instead of asking the user.
    pub standards_mode: bool,
    /// Instructions between count hooks.
    pub hook_interval: u32,
    /// Minimum spacing of `mouse_move` events; negative disables them.
    pub mouse_move_throttle_ms: i64,
    pub monitors_use_mouse_events: bool,
    pub default_width: u32,
    pub default_height: u32,
    /// Root of per-computer data directories. Defaults to the platform data
    /// directory.
    pub data_dir: Option<PathBuf>,
    /// Host directory mounted read-only at `rom`.
    pub rom_dir: Option<PathBuf>,
    pub rom_read_only: bool,
    /// Ask the UI before a guest mounts a host directory.
    pub show_mount_prompt: bool,
    /// Allow debugger sessions to attach.
    pub debug_enable: bool,
    /// Mounts applied to every computer at boot, in order.
    pub mounts: Vec<MountSpec>,
    pub remote: RemoteConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            abort_timeout_ms: 17_000,
            standards_mode: false,
            hook_interval: 100,
            mouse_move_throttle_ms: 100,
            monitors_use_mouse_events: false,
            default_width: 51,
            default_height: 19,
            data_dir: None,
            rom_dir: None,
            rom_read_only: true,
            show_mount_prompt: false,
            debug_enable: true,
            mounts: Vec::new(),
            remote: RemoteConfig::default(),
        }
    }
}

/// One `{comp_path, backing, read_only}` startup mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub comp_path: String,
    /// Host path, or `N:` / `N:sub/dir` for a registered virtual image.
    pub backing: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Checksum the decoded payload instead of the base64 text.
    pub binary_checksum: bool,
    /// Features advertised in the line protocol handshake.
    pub features: Vec<String>,
}

impl HostConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse host configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Effective abort timeout.
    pub fn abort_timeout(&self) -> Duration {
        if self.standards_mode {
            STANDARDS_TIMEOUT
        } else {
            Duration::from_millis(self.abort_timeout_ms)
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            mouse_move_throttle: u64::try_from(self.mouse_move_throttle_ms)
                .ok()
                .map(Duration::from_millis),
            monitors_use_mouse_events: self.monitors_use_mouse_events,
        }
    }

    pub fn data_root(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            HostPaths::resolve()
                .map(|p| p.data)
                .unwrap_or_else(|| std::env::temp_dir().join(crate::paths::APP_NAME))
        })
    }

    /// Private root directory backing computer `id`.
    pub fn computer_dir(&self, id: ComputerId) -> PathBuf {
        paths::computer_root(&self.data_root(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = HostConfig::from_toml_str(
            r#"
            abort_timeout_ms = 5000

            [[mounts]]
            comp_path = "share"
            backing = "0:"
            read_only = true

            [remote]
            binary_checksum = true
            "#,
        )
        .unwrap();
        assert_eq!(config.abort_timeout(), Duration::from_millis(5000));
        assert_eq!(config.default_width, 51);
        assert_eq!(config.mounts.len(), 1);
        assert!(config.mounts[0].read_only);
        assert!(config.remote.binary_checksum);
    }

    #[test]
    fn standards_mode_pins_the_timeout() {
        let config = HostConfig { standards_mode: true, abort_timeout_ms: 1, ..Default::default() };
        assert_eq!(config.abort_timeout(), STANDARDS_TIMEOUT);
    }

    #[test]
    fn negative_throttle_disables_mouse_move() {
        let config = HostConfig { mouse_move_throttle_ms: -1, ..Default::default() };
        assert!(config.router_options().mouse_move_throttle.is_none());
    }

    #[test]
    fn computer_dirs_live_under_the_data_root() {
        let config = HostConfig { data_dir: Some(PathBuf::from("/tmp/vc")), ..Default::default() };
        assert_eq!(config.computer_dir(4), PathBuf::from("/tmp/vc/computer/4"));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(HostConfig::from_toml_str("abort_timeout_ms = \"soon\"").is_err());
    }
}
