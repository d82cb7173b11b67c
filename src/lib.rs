//! Registry for long-running visualization instances bound to log directories.
//!
//! The [`Registry`] keeps a deduplicated list of running instances in step
//! with a [`Backend`], publishes change events, and tracks handles for the
//! instances this process started. [`format_dir`] renders log-directory
//! strings relative to the workspace root.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod model;
pub mod registry;

pub use backend::{Backend, HttpBackend, HttpBackendConfig, InMemoryBackend, Operation};
pub use config::RegistryConfig;
pub use error::{BackendError, RegistryError, ValidationError};
pub use format::format_dir;
pub use model::{InstanceModel, RegistryEvent, Snapshot, StartOptions, StaticConfig};
pub use registry::{InstanceHandle, PendingGate, PollGate, Registry};
