use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default reload interval (seconds) used when the caller does not pick one.
pub const DEFAULT_RELOAD_INTERVAL: i64 = 120;

/// One running instance as reported by the backend.
///
/// Snapshots are compared by value; `name` is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceModel {
    pub name: String,
    /// One or more directories, comma-joined, each optionally `label:`-prefixed.
    pub logdir: String,
    /// Seconds between reloads; 0 disables reloading. Kept signed so a
    /// backend echoing back a negative request still decodes.
    #[serde(default)]
    pub reload_interval: i64,
    #[serde(default)]
    pub enable_multi_log: bool,
    #[serde(default)]
    pub additional_args: String,
}

impl InstanceModel {
    pub fn new(name: impl Into<String>, logdir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logdir: logdir.into(),
            reload_interval: 0,
            enable_multi_log: false,
            additional_args: String::new(),
        }
    }
}

/// Server-side settings fetched once when the registry is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Workspace root that log directories are displayed relative to.
    pub notebook_dir: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StaticConfig {
    pub fn new(notebook_dir: impl Into<String>) -> Self {
        Self {
            notebook_dir: notebook_dir.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Parameters for creating a new instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Passed to the backend unchecked; see [`StartOptions::validate`].
    pub reload_interval: i64,
    pub enable_multi_log: bool,
    pub additional_args: String,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            enable_multi_log: false,
            additional_args: String::new(),
        }
    }
}

impl StartOptions {
    /// Caller-side checks run before any network call.
    pub fn validate(&self, logdir: &str) -> Result<(), ValidationError> {
        if logdir.trim().is_empty() {
            return Err(ValidationError::EmptyLogdir);
        }
        if self.reload_interval < 0 {
            return Err(ValidationError::NegativeReloadInterval(self.reload_interval));
        }
        Ok(())
    }
}

/// Shared, immutable view of the running list at one point in time.
pub type Snapshot = Arc<[InstanceModel]>;

/// Notifications published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// The authoritative list changed; carries the full new list.
    RunningChanged(Snapshot),
}

impl RegistryEvent {
    pub fn snapshot(&self) -> &[InstanceModel] {
        match self {
            RegistryEvent::RunningChanged(models) => models,
        }
    }
}
