//! Registry settings and the optional on-disk config file.

use crate::model::StartOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Period of the background poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `None` disables the background poller; callers refresh by hand.
    pub poll_interval: Option<Duration>,
    /// Remove an instance from the running list before the backend confirms
    /// its shutdown. With `false` the entry stays until the call succeeds.
    pub optimistic_shutdown: bool,
    /// Issue a poll after `start`/`shutdown` settle.
    pub reconcile_after_mutation: bool,
    /// Options used by callers that do not pick their own.
    pub default_start: StartOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            optimistic_shutdown: true,
            reconcile_after_mutation: true,
            default_start: StartOptions::default(),
        }
    }
}

/// Settings read from `config.json`. Every field is optional; CLI flags win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    pub optimistic_shutdown: Option<bool>,
    pub reload_interval: Option<i64>,
}

/// `<config dir>/board-registry/config.json`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("board-registry").join("config.json"))
}

/// Read a config file. A missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}
