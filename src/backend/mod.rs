//! Collaborators that own the authoritative list of running instances.
//!
//! The registry talks to a [`Backend`]; [`HttpBackend`] speaks the server's
//! REST API and [`InMemoryBackend`] is a scriptable stand-in for tests and demos.

mod http;
mod memory;

pub use http::{HttpBackend, HttpBackendConfig};
pub use memory::{InMemoryBackend, Operation};

use crate::error::BackendError;
use crate::model::{InstanceModel, StartOptions, StaticConfig};
use async_trait::async_trait;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Current authoritative list, in server order.
    async fn list_running(&self) -> Result<Vec<InstanceModel>, BackendError>;

    /// Create an instance for `logdir`, or return the one already serving it.
    async fn start_new(
        &self,
        logdir: &str,
        options: &StartOptions,
    ) -> Result<InstanceModel, BackendError>;

    async fn shutdown_instance(&self, name: &str) -> Result<(), BackendError>;

    async fn static_config(&self) -> Result<StaticConfig, BackendError>;
}
