use super::Backend;
use crate::error::BackendError;
use crate::model::{InstanceModel, StartOptions, StaticConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Backend calls, used for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Start,
    Shutdown,
    StaticConfig,
}

#[derive(Default)]
struct MemState {
    running: Vec<InstanceModel>,
    next_name: u64,
    static_config: Option<StaticConfig>,
    failing: HashMap<Operation, bool>,
    calls: HashMap<Operation, usize>,
}

impl MemState {
    fn enter(&mut self, op: Operation) -> Result<(), BackendError> {
        *self.calls.entry(op).or_default() += 1;
        if self.failing.get(&op).copied().unwrap_or(false) {
            return Err(BackendError::Unavailable(format!("{op:?} failure injected")));
        }
        Ok(())
    }
}

/// Scriptable in-process backend.
///
/// Names are allocated as `"1"`, `"2"`, ...; starting an instance for a logdir
/// that is already served returns the existing instance. Shutdown calls can be
/// held pending with [`InMemoryBackend::hold_shutdowns`].
pub struct InMemoryBackend {
    state: Mutex<MemState>,
    shutdowns_released: watch::Sender<bool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (shutdowns_released, _) = watch::channel(true);
        Self {
            state: Mutex::new(MemState {
                next_name: 1,
                ..Default::default()
            }),
            shutdowns_released,
        }
    }

    pub fn with_static_config(self, notebook_dir: impl Into<String>) -> Self {
        self.lock().static_config = Some(StaticConfig::new(notebook_dir));
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the authoritative list, as if instances changed out of band.
    pub fn set_running(&self, models: Vec<InstanceModel>) {
        self.lock().running = models;
    }

    pub fn running(&self) -> Vec<InstanceModel> {
        self.lock().running.clone()
    }

    /// Drop an instance without going through the API (crash, idle timeout).
    pub fn terminate_externally(&self, name: &str) {
        self.lock().running.retain(|m| m.name != name);
    }

    pub fn set_failing(&self, op: Operation, failing: bool) {
        self.lock().failing.insert(op, failing);
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Shutdown calls block until [`InMemoryBackend::release_shutdowns`].
    pub fn hold_shutdowns(&self) {
        self.shutdowns_released.send_replace(false);
    }

    pub fn release_shutdowns(&self) {
        self.shutdowns_released.send_replace(true);
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn list_running(&self) -> Result<Vec<InstanceModel>, BackendError> {
        let mut state = self.lock();
        state.enter(Operation::List)?;
        Ok(state.running.clone())
    }

    async fn start_new(
        &self,
        logdir: &str,
        options: &StartOptions,
    ) -> Result<InstanceModel, BackendError> {
        let mut state = self.lock();
        state.enter(Operation::Start)?;
        if let Some(existing) = state.running.iter().find(|m| m.logdir == logdir) {
            return Ok(existing.clone());
        }
        let name = state.next_name.to_string();
        state.next_name += 1;
        let model = InstanceModel {
            name,
            logdir: logdir.to_string(),
            reload_interval: options.reload_interval,
            enable_multi_log: options.enable_multi_log,
            additional_args: options.additional_args.clone(),
        };
        state.running.push(model.clone());
        Ok(model)
    }

    async fn shutdown_instance(&self, name: &str) -> Result<(), BackendError> {
        *self.lock().calls.entry(Operation::Shutdown).or_default() += 1;
        let mut released = self.shutdowns_released.subscribe();
        let _ = released.wait_for(|r| *r).await;

        let mut state = self.lock();
        if state.failing.get(&Operation::Shutdown).copied().unwrap_or(false) {
            return Err(BackendError::Unavailable("Shutdown failure injected".into()));
        }
        let before = state.running.len();
        state.running.retain(|m| m.name != name);
        if state.running.len() == before {
            return Err(BackendError::Status {
                status: 404,
                body: format!("no instance named {name}"),
            });
        }
        Ok(())
    }

    async fn static_config(&self) -> Result<StaticConfig, BackendError> {
        let mut state = self.lock();
        state.enter(Operation::StaticConfig)?;
        state
            .static_config
            .clone()
            .ok_or_else(|| BackendError::Status {
                status: 404,
                body: "static config not available".into(),
            })
    }
}
