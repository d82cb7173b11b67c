//! Instance registry.
//!
//! Owns the deduplicated list of running instances, keeps it in step with the
//! backend through a background poll, and publishes a [`RegistryEvent`]
//! whenever the list changes. Instances started through this registry also get
//! an [`InstanceHandle`] that is told when the instance goes away.

mod handle;
mod poller;
mod state;

pub use handle::InstanceHandle;
pub use poller::{AlwaysPoll, PendingGate, PendingGuard, PollGate};
pub use state::InvariantViolation;

use crate::backend::Backend;
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::format::format_dir;
use crate::model::{InstanceModel, RegistryEvent, Snapshot, StartOptions, StaticConfig};
use futures::future::join_all;
use state::{PollOutcome, RegistryState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Waiting,
    Ready,
    /// Disposed before any poll result was applied.
    Abandoned,
}

struct Shared {
    state: RegistryState,
    /// `None` once disposed; dropping the sender closes every subscription.
    events: Option<broadcast::Sender<RegistryEvent>>,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.events.is_none()
    }

    /// Publish the current snapshot. Called with the lock held, after the
    /// mutation, so every receiver sees events in mutation order.
    fn publish(&self) {
        if let Some(tx) = &self.events {
            let snapshot = self.state.models();
            debug!(count = snapshot.len(), "running instances changed");
            let _ = tx.send(RegistryEvent::RunningChanged(snapshot));
        }
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            if let Err(violation) = self.state.check_invariants() {
                panic!("registry bookkeeping broken: {violation}");
            }
        }
    }
}

pub struct Registry {
    backend: Arc<dyn Backend>,
    config: RegistryConfig,
    static_config: Option<StaticConfig>,
    shared: Mutex<Shared>,
    ready: watch::Sender<Readiness>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Build a registry that polls unconditionally.
    pub async fn new(backend: Arc<dyn Backend>, config: RegistryConfig) -> Arc<Self> {
        Self::with_poll_gate(backend, config, Arc::new(AlwaysPoll)).await
    }

    /// Build a registry whose background poll consults `gate` on every tick.
    ///
    /// Fetches the static config once; on failure directory formatting falls
    /// back to showing paths unchanged.
    pub async fn with_poll_gate(
        backend: Arc<dyn Backend>,
        config: RegistryConfig,
        gate: Arc<dyn PollGate>,
    ) -> Arc<Self> {
        let static_config = match backend.static_config().await {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!(error = %e, "static config unavailable, directories shown unformatted");
                None
            }
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (ready, _) = watch::channel(Readiness::Waiting);
        let poll_interval = config.poll_interval;

        let registry = Arc::new(Self {
            backend,
            config,
            static_config,
            shared: Mutex::new(Shared {
                state: RegistryState::default(),
                events: Some(events),
            }),
            ready,
            poller: Mutex::new(None),
        });

        if let Some(period) = poll_interval {
            let task = poller::spawn_poller(Arc::downgrade(&registry), period, gate);
            *lock(&registry.poller) = Some(task);
        }
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn static_config(&self) -> Option<&StaticConfig> {
        self.static_config.as_ref()
    }

    /// Snapshot of the running list at call time. Iterate it as often as needed;
    /// it does not follow later changes.
    pub fn running(&self) -> Snapshot {
        lock(&self.shared).state.models()
    }

    pub fn find_by_logdir(&self, logdir: &str) -> Option<InstanceModel> {
        lock(&self.shared)
            .state
            .models()
            .iter()
            .find(|m| m.logdir == logdir)
            .cloned()
    }

    /// Show `dir` relative to the workspace root.
    pub fn format_dir(&self, dir: &str) -> String {
        let root = self.static_config.as_ref().map(|c| c.notebook_dir.as_str());
        format_dir(root, dir)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        match &lock(&self.shared).events {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// True once a poll result has been applied.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == Readiness::Ready
    }

    /// Wait for the first applied poll. Returns early if the registry is
    /// disposed first.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|r| *r != Readiness::Waiting).await;
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared).is_disposed()
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        lock(&self.shared).state.check_invariants()
    }

    /// Start (or reuse) an instance for `logdir`.
    ///
    /// `options.reload_interval` is passed through as given; validate with
    /// [`StartOptions::validate`] beforehand.
    pub async fn start(
        &self,
        logdir: &str,
        options: StartOptions,
    ) -> Result<InstanceHandle, RegistryError> {
        if self.is_disposed() {
            return Err(RegistryError::Disposed);
        }
        let model = self.backend.start_new(logdir, &options).await?;
        info!(name = %model.name, logdir, "instance started");

        if self.config.reconcile_after_mutation {
            if let Err(e) = self.refresh_running().await {
                warn!(error = %e, "poll after start failed");
            }
        }

        let handle = InstanceHandle::new(model);
        let mut shared = lock(&self.shared);
        if shared.is_disposed() {
            return Err(RegistryError::Disposed);
        }
        if shared.state.record_start(handle.clone()) {
            shared.publish();
        }
        shared.debug_check();
        Ok(handle)
    }

    /// Start with the configured default options.
    pub async fn start_default(&self, logdir: &str) -> Result<InstanceHandle, RegistryError> {
        self.start(logdir, self.config.default_start.clone()).await
    }

    /// Shut an instance down. Unknown names are ignored.
    ///
    /// Backend failures are logged, not returned: with optimistic shutdown the
    /// instance has already left the running list by the time the call fails.
    pub async fn shutdown(&self, name: &str) {
        {
            let mut shared = lock(&self.shared);
            if shared.is_disposed() || !shared.state.contains(name) {
                debug!(name, "shutdown ignored, instance not running");
                return;
            }
            if self.config.optimistic_shutdown && shared.state.remove_optimistic(name) {
                shared.publish();
            }
        }

        self.shutdown_remote(name).await;

        if self.config.reconcile_after_mutation {
            if let Err(e) = self.refresh_running().await {
                warn!(error = %e, "poll after shutdown failed");
            }
        }
    }

    /// Shut down every running instance. Emits at most one event for the
    /// whole batch, up front when shutdown is optimistic.
    pub async fn shutdown_all(&self) {
        let captured = {
            let mut shared = lock(&self.shared);
            if shared.is_disposed() || shared.state.models().is_empty() {
                return;
            }
            if self.config.optimistic_shutdown {
                let taken = shared.state.take_all();
                shared.publish();
                taken
            } else {
                shared.state.models()
            }
        };
        info!(count = captured.len(), "shutting down all instances");

        let settled = join_all(captured.iter().map(|m| async move {
            (m.name.as_str(), self.call_shutdown(&m.name).await)
        }))
        .await;

        {
            let mut shared = lock(&self.shared);
            if shared.is_disposed() {
                return;
            }
            let remove_confirmed = !self.config.optimistic_shutdown;
            if shared.state.finish_shutdowns(&settled, remove_confirmed) {
                shared.publish();
            }
            shared.debug_check();
        }

        if self.config.reconcile_after_mutation {
            if let Err(e) = self.refresh_running().await {
                warn!(error = %e, "poll after shutdown failed");
            }
        }
    }

    async fn call_shutdown(&self, name: &str) -> bool {
        match self.backend.shutdown_instance(name).await {
            Ok(()) => {
                info!(name, "instance shut down");
                true
            }
            Err(e) => {
                warn!(name, error = %e, "shutdown failed");
                false
            }
        }
    }

    async fn shutdown_remote(&self, name: &str) {
        let confirmed = self.call_shutdown(name).await;

        let mut shared = lock(&self.shared);
        if shared.is_disposed() {
            return;
        }
        let remove_now = confirmed && !self.config.optimistic_shutdown;
        if shared.state.finish_shutdown(name, remove_now) {
            shared.publish();
        }
        shared.debug_check();
    }

    /// Fetch the authoritative list and reconcile local state with it.
    ///
    /// A failed fetch leaves state untouched. Safe to call concurrently; a
    /// result that was overtaken by a newer poll or a local change is dropped.
    pub async fn refresh_running(&self) -> Result<(), RegistryError> {
        let seq = {
            let mut shared = lock(&self.shared);
            if shared.is_disposed() {
                return Err(RegistryError::Disposed);
            }
            shared.state.begin_poll()
        };

        let fetched = self.backend.list_running().await?;

        let mut shared = lock(&self.shared);
        if shared.is_disposed() {
            return Ok(());
        }
        let outcome = shared.state.apply_poll(seq, fetched);
        if outcome == PollOutcome::Changed {
            shared.publish();
        }
        shared.debug_check();
        drop(shared);

        if outcome != PollOutcome::Stale {
            self.settle_ready(Readiness::Ready);
        }
        Ok(())
    }

    /// Stop polling, close subscriptions and forget the running list.
    ///
    /// Backend instances keep running. Calling this again does nothing.
    pub fn dispose(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.is_disposed() {
                return;
            }
            shared.events = None;
            shared.state.clear();
        }
        if let Some(task) = lock(&self.poller).take() {
            task.abort();
        }
        self.settle_ready(Readiness::Abandoned);
        debug!("registry disposed");
    }

    /// Leave `Waiting` at most once.
    fn settle_ready(&self, to: Readiness) {
        self.ready.send_if_modified(|r| {
            if *r != Readiness::Waiting {
                return false;
            }
            *r = to;
            true
        });
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.poller).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
