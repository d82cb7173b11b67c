//! Bookkeeping behind the registry, free of I/O.
//!
//! Two maps keyed by instance name: the authoritative snapshot (`models`) and
//! the locally started handles. Every method runs under the registry lock and
//! reports whether observers must be notified.

use super::handle::InstanceHandle;
use crate::model::{InstanceModel, Snapshot};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Broken bookkeeping detected by [`RegistryState::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    DuplicateName(String),
    OrphanHandle(String),
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::DuplicateName(name) => {
                write!(f, "instance {name} appears more than once")
            }
            InvariantViolation::OrphanHandle(name) => {
                write!(f, "handle {name} has no running instance")
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Outcome of applying a fetched list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Changed,
    Unchanged,
    /// A newer poll or a local mutation landed while this fetch was in flight.
    Stale,
}

pub(crate) struct RegistryState {
    models: Snapshot,
    handles: HashMap<String, Vec<InstanceHandle>>,
    /// Names removed optimistically whose remote shutdown has not settled.
    pending_shutdowns: HashSet<String>,
    issued_seq: u64,
    applied_seq: u64,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            models: Vec::new().into(),
            handles: HashMap::new(),
            pending_shutdowns: HashSet::new(),
            issued_seq: 0,
            applied_seq: 0,
        }
    }
}

/// Keep the first entry for each name, preserving server order.
pub(crate) fn dedupe_by_name(models: Vec<InstanceModel>) -> Vec<InstanceModel> {
    let mut seen = HashSet::with_capacity(models.len());
    models
        .into_iter()
        .filter(|m| seen.insert(m.name.clone()))
        .collect()
}

impl RegistryState {
    pub(crate) fn models(&self) -> Snapshot {
        self.models.clone()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.models.iter().any(|m| m.name == name)
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self, name: &str) -> usize {
        self.handles.get(name).map(Vec::len).unwrap_or(0)
    }

    /// Ticket for a fetch about to be issued.
    pub(crate) fn begin_poll(&mut self) -> u64 {
        self.issued_seq += 1;
        self.issued_seq
    }

    /// Local mutations win over any fetch already in flight.
    fn mark_mutation(&mut self) {
        self.applied_seq = self.issued_seq;
    }

    /// Diff a fetched list against the snapshot.
    ///
    /// On change, handles whose names vanished are disposed before the
    /// snapshot is replaced.
    pub(crate) fn apply_poll(&mut self, seq: u64, fetched: Vec<InstanceModel>) -> PollOutcome {
        if seq <= self.applied_seq {
            debug!(seq, applied = self.applied_seq, "discarding stale poll result");
            return PollOutcome::Stale;
        }
        self.applied_seq = seq;

        let fresh: Vec<InstanceModel> = dedupe_by_name(fetched)
            .into_iter()
            .filter(|m| !self.pending_shutdowns.contains(&m.name))
            .collect();
        if fresh.as_slice() == &*self.models {
            return PollOutcome::Unchanged;
        }

        let alive: HashSet<&str> = fresh.iter().map(|m| m.name.as_str()).collect();
        let pending = &self.pending_shutdowns;
        self.handles.retain(|name, handles| {
            if alive.contains(name.as_str()) || pending.contains(name) {
                return true;
            }
            debug!(name = %name, count = handles.len(), "instance gone, disposing handles");
            for handle in handles.iter() {
                handle.dispose();
            }
            false
        });
        self.models = fresh.into();
        PollOutcome::Changed
    }

    /// Record a handle from a successful start. Returns `true` when the
    /// instance was new to the snapshot.
    pub(crate) fn record_start(&mut self, handle: InstanceHandle) -> bool {
        let model = handle.model().clone();
        let bucket = self.handles.entry(model.name.clone()).or_default();
        if !bucket.iter().any(|h| h.same_as(&handle)) {
            bucket.push(handle);
        }
        if self.contains(&model.name) {
            return false;
        }
        let mut models = self.models.to_vec();
        models.push(model);
        self.models = models.into();
        self.mark_mutation();
        true
    }

    /// Drop `name` from the snapshot ahead of the remote shutdown.
    pub(crate) fn remove_optimistic(&mut self, name: &str) -> bool {
        if !self.contains(name) {
            return false;
        }
        self.models = self
            .models
            .iter()
            .filter(|m| m.name != name)
            .cloned()
            .collect::<Vec<_>>()
            .into();
        self.pending_shutdowns.insert(name.to_string());
        self.mark_mutation();
        true
    }

    /// Empty the snapshot ahead of a batch shutdown, returning what was there.
    pub(crate) fn take_all(&mut self) -> Snapshot {
        let taken = std::mem::replace(&mut self.models, Vec::new().into());
        self.pending_shutdowns.extend(taken.iter().map(|m| m.name.clone()));
        self.mark_mutation();
        taken
    }

    /// The remote shutdown for `name` settled.
    ///
    /// Handles are disposed regardless of outcome. When the removal was not
    /// optimistic, a confirmed shutdown removes the entry now; the return value
    /// says whether the snapshot changed.
    pub(crate) fn finish_shutdown(&mut self, name: &str, confirmed: bool) -> bool {
        self.pending_shutdowns.remove(name);
        if let Some(handles) = self.handles.remove(name) {
            for handle in &handles {
                handle.dispose();
            }
        }
        if confirmed && self.contains(name) {
            self.models = self
                .models
                .iter()
                .filter(|m| m.name != name)
                .cloned()
                .collect::<Vec<_>>()
                .into();
            self.mark_mutation();
            return true;
        }
        false
    }

    /// Settle a batch of remote shutdowns as one mutation. Returns whether
    /// the snapshot changed.
    pub(crate) fn finish_shutdowns(
        &mut self,
        settled: &[(&str, bool)],
        remove_confirmed: bool,
    ) -> bool {
        let mut changed = false;
        for &(name, confirmed) in settled {
            changed |= self.finish_shutdown(name, remove_confirmed && confirmed);
        }
        changed
    }

    /// Forget everything without touching handle termination state.
    pub(crate) fn clear(&mut self) {
        self.models = Vec::new().into();
        self.handles.clear();
        self.pending_shutdowns.clear();
        self.mark_mutation();
    }

    pub(crate) fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut names = HashSet::with_capacity(self.models.len());
        for model in self.models.iter() {
            if !names.insert(model.name.as_str()) {
                return Err(InvariantViolation::DuplicateName(model.name.clone()));
            }
        }
        for name in self.handles.keys() {
            if !names.contains(name.as_str()) && !self.pending_shutdowns.contains(name) {
                return Err(InvariantViolation::OrphanHandle(name.clone()));
            }
        }
        Ok(())
    }
}
