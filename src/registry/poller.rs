//! Background refresh loop.

use super::Registry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};

/// Decides whether a scheduled poll should run right now.
///
/// Hosts use this to skip polling while backgrounded, or while an operation
/// whose intermediate states should not be observed is in flight.
pub trait PollGate: Send + Sync {
    fn should_poll(&self) -> bool;
}

impl<F> PollGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_poll(&self) -> bool {
        self()
    }
}

/// Gate that never skips.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysPoll;

impl PollGate for AlwaysPoll {
    fn should_poll(&self) -> bool {
        true
    }
}

/// Closes while any tracked operation is pending.
#[derive(Debug, Default)]
pub struct PendingGate {
    pending: Arc<AtomicUsize>,
}

impl PendingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an operation pending until the guard drops.
    pub fn begin(&self) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            pending: self.pending.clone(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

impl PollGate for PendingGate {
    fn should_poll(&self) -> bool {
        !self.is_pending()
    }
}

#[must_use = "the operation stops counting as pending when the guard drops"]
pub struct PendingGuard {
    pending: Arc<AtomicUsize>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawn the poll loop. The first tick fires immediately.
///
/// The task only holds a weak reference and exits once the registry is
/// dropped or disposed.
pub(crate) fn spawn_poller(
    registry: Weak<Registry>,
    period: Duration,
    gate: Arc<dyn PollGate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(strong) = registry.upgrade() else {
                break;
            };
            if strong.is_disposed() {
                break;
            }
            if !gate.should_poll() {
                trace!("poll skipped by gate");
                continue;
            }
            if let Err(e) = strong.refresh_running().await {
                warn!(error = %e, "background poll failed");
            }
        }
        trace!("poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_gate_closes_while_guard_lives() {
        let gate = PendingGate::new();
        assert!(gate.should_poll());
        let first = gate.begin();
        let second = gate.begin();
        assert!(!gate.should_poll());
        drop(first);
        assert!(!gate.should_poll());
        drop(second);
        assert!(gate.should_poll());
    }

    #[test]
    fn closures_are_gates() {
        let gate: Arc<dyn PollGate> = Arc::new(|| false);
        assert!(!gate.should_poll());
        assert!(AlwaysPoll.should_poll());
    }
}
