use super::*;
use crate::backend::{Backend, InMemoryBackend, Operation};
use crate::error::BackendError;
use crate::model::StaticConfig;
use async_trait::async_trait;
use crate::format::WORKSPACE_ROOT_SENTINEL;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

fn m(name: &str, logdir: &str) -> InstanceModel {
    InstanceModel::new(name, logdir)
}

/// No background poll and no follow-up polls, so every event is caused by
/// the call under test.
fn manual() -> RegistryConfig {
    RegistryConfig {
        poll_interval: None,
        reconcile_after_mutation: false,
        ..Default::default()
    }
}

async fn setup(config: RegistryConfig) -> (Arc<InMemoryBackend>, Arc<Registry>) {
    let backend = Arc::new(InMemoryBackend::new().with_static_config("/home/user"));
    let registry = Registry::new(backend.clone(), config).await;
    (backend, registry)
}

fn expect_event(rx: &mut broadcast::Receiver<RegistryEvent>) -> Vec<InstanceModel> {
    match rx.try_recv() {
        Ok(event) => event.snapshot().to_vec(),
        Err(e) => panic!("expected an event, got {e:?}"),
    }
}

fn expect_quiet(rx: &mut broadcast::Receiver<RegistryEvent>) {
    assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
}

/// Holds every list call until released, to overlap a poll with a mutation.
struct HeldList {
    inner: InMemoryBackend,
    release: watch::Sender<bool>,
}

impl HeldList {
    fn new() -> Self {
        Self {
            inner: InMemoryBackend::new(),
            release: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl Backend for HeldList {
    async fn list_running(&self) -> Result<Vec<InstanceModel>, BackendError> {
        let mut released = self.release.subscribe();
        let _ = released.wait_for(|r| *r).await;
        self.inner.list_running().await
    }

    async fn start_new(
        &self,
        logdir: &str,
        options: &StartOptions,
    ) -> Result<InstanceModel, BackendError> {
        self.inner.start_new(logdir, options).await
    }

    async fn shutdown_instance(&self, name: &str) -> Result<(), BackendError> {
        self.inner.shutdown_instance(name).await
    }

    async fn static_config(&self) -> Result<StaticConfig, BackendError> {
        self.inner.static_config().await
    }
}

#[tokio::test]
async fn refresh_emits_only_on_change_and_disposes_vanished_handles() {
    let (backend, registry) = setup(manual()).await;
    let mut rx = registry.subscribe();
    backend.set_running(vec![m("tb1", "/a")]);

    registry.refresh_running().await.unwrap();
    assert_eq!(expect_event(&mut rx), vec![m("tb1", "/a")]);

    registry.refresh_running().await.unwrap();
    expect_quiet(&mut rx);

    // A handle for tb1 obtained through start (reuses the running instance).
    let handle = registry.start("/a", StartOptions::default()).await.unwrap();
    assert_eq!(handle.name(), "tb1");
    expect_quiet(&mut rx);

    backend.terminate_externally("tb1");
    registry.refresh_running().await.unwrap();
    assert!(expect_event(&mut rx).is_empty());
    assert!(handle.is_terminated());
    assert!(registry.running().is_empty());
    registry.check_invariants().unwrap();
}

#[tokio::test]
async fn failed_refresh_leaves_state_untouched() {
    let (backend, registry) = setup(manual()).await;
    backend.set_running(vec![m("1", "/a")]);
    registry.refresh_running().await.unwrap();
    let mut rx = registry.subscribe();

    backend.set_running(vec![]);
    backend.set_failing(Operation::List, true);
    let err = registry.refresh_running().await.unwrap_err();
    assert!(matches!(err, RegistryError::Backend(BackendError::Unavailable(_))));
    assert_eq!(&*registry.running(), &[m("1", "/a")]);
    expect_quiet(&mut rx);
}

#[tokio::test]
async fn ready_after_first_successful_poll() {
    let (backend, registry) = setup(manual()).await;
    assert!(!registry.is_ready());

    backend.set_failing(Operation::List, true);
    assert!(registry.refresh_running().await.is_err());
    assert!(!registry.is_ready());

    backend.set_failing(Operation::List, false);
    registry.refresh_running().await.unwrap();
    assert!(registry.is_ready());
    tokio::time::timeout(Duration::from_secs(1), registry.ready())
        .await
        .expect("ready resolves once set");
}

#[tokio::test]
async fn stale_poll_does_not_mark_ready() {
    let backend = Arc::new(HeldList::new());
    let registry = Registry::new(backend.clone(), manual()).await;

    let poll = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.refresh_running().await })
    };
    while backend.release.receiver_count() == 0 {
        tokio::task::yield_now().await;
    }
    registry.start("/a", StartOptions::default()).await.unwrap();
    backend.release.send_replace(true);
    poll.await.unwrap().unwrap();

    assert!(!registry.is_ready());
    assert_eq!(registry.running().len(), 1);

    registry.refresh_running().await.unwrap();
    assert!(registry.is_ready());
}

#[tokio::test]
async fn ready_resolves_when_disposed_first() {
    let (_backend, registry) = setup(manual()).await;
    registry.dispose();
    tokio::time::timeout(Duration::from_secs(1), registry.ready())
        .await
        .expect("ready resolves after dispose");
    assert!(!registry.is_ready());
}

#[tokio::test]
async fn start_appends_new_instance_and_emits() {
    let (backend, registry) = setup(manual()).await;
    let mut rx = registry.subscribe();

    let handle = registry.start("/home/user/runs", StartOptions::default()).await.unwrap();
    assert_eq!(handle.model().reload_interval, 120);
    let snapshot = expect_event(&mut rx);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, handle.name());
    assert_eq!(backend.running().len(), 1);
    assert!(!handle.is_terminated());
}

#[tokio::test]
async fn start_for_running_logdir_keeps_one_entry() {
    for reconcile in [false, true] {
        let config = RegistryConfig {
            reconcile_after_mutation: reconcile,
            ..manual()
        };
        let (backend, registry) = setup(config).await;
        backend.set_running(vec![m("1", "/a")]);
        registry.refresh_running().await.unwrap();
        let mut rx = registry.subscribe();

        let first = registry.start("/a", StartOptions::default()).await.unwrap();
        let second = registry.start("/a", StartOptions::default()).await.unwrap();
        assert_eq!(first.name(), "1");
        assert_eq!(second.name(), "1");
        assert_eq!(registry.running().iter().filter(|m| m.name == "1").count(), 1);
        expect_quiet(&mut rx);
    }
}

#[tokio::test]
async fn start_with_follow_up_poll_emits_once() {
    let config = RegistryConfig {
        reconcile_after_mutation: true,
        ..manual()
    };
    let (backend, registry) = setup(config).await;
    let mut rx = registry.subscribe();

    registry.start("/b", StartOptions::default()).await.unwrap();
    assert_eq!(expect_event(&mut rx).len(), 1);
    expect_quiet(&mut rx);
    assert_eq!(backend.calls(Operation::List), 1);
}

#[tokio::test]
async fn start_failure_propagates_without_event() {
    let (backend, registry) = setup(manual()).await;
    let mut rx = registry.subscribe();
    backend.set_failing(Operation::Start, true);

    let err = registry.start("/a", StartOptions::default()).await.unwrap_err();
    assert!(matches!(err, RegistryError::Backend(_)));
    assert!(registry.running().is_empty());
    expect_quiet(&mut rx);
}

#[tokio::test]
async fn negative_reload_interval_is_passed_through() {
    let (backend, registry) = setup(manual()).await;
    let opts = StartOptions {
        reload_interval: -1,
        ..Default::default()
    };
    let handle = registry.start("/a", opts).await.unwrap();
    assert_eq!(backend.calls(Operation::Start), 1);
    assert_eq!(handle.model().reload_interval, -1);
    assert_eq!(backend.running()[0].reload_interval, -1);
}

#[tokio::test]
async fn shutdown_of_unknown_name_is_a_noop() {
    let (backend, registry) = setup(manual()).await;
    backend.set_running(vec![m("1", "/a")]);
    registry.refresh_running().await.unwrap();
    let mut rx = registry.subscribe();

    registry.shutdown("nope").await;
    expect_quiet(&mut rx);
    assert_eq!(backend.calls(Operation::Shutdown), 0);
    assert_eq!(registry.running().len(), 1);
}

#[tokio::test]
async fn shutdown_removes_before_backend_settles() {
    let (backend, registry) = setup(manual()).await;
    let handle = registry.start("/a", StartOptions::default()).await.unwrap();
    let name = handle.name().to_string();
    let mut rx = registry.subscribe();

    backend.hold_shutdowns();
    let task = {
        let registry = registry.clone();
        let name = name.clone();
        tokio::spawn(async move { registry.shutdown(&name).await })
    };
    while backend.calls(Operation::Shutdown) == 0 {
        tokio::task::yield_now().await;
    }

    assert!(expect_event(&mut rx).is_empty());
    assert!(registry.running().iter().all(|m| m.name != name));
    assert!(!handle.is_terminated());
    registry.check_invariants().unwrap();

    backend.release_shutdowns();
    task.await.unwrap();
    assert!(handle.is_terminated());
    expect_quiet(&mut rx);
    assert!(backend.running().is_empty());
}

#[tokio::test]
async fn failed_shutdown_is_swallowed_and_disposes_handles() {
    let (backend, registry) = setup(manual()).await;
    let handle = registry.start("/a", StartOptions::default()).await.unwrap();
    backend.set_failing(Operation::Shutdown, true);

    registry.shutdown(handle.name()).await;
    assert!(handle.is_terminated());
    assert!(registry.running().is_empty());
    // The backend still has it; the next poll brings it back.
    registry.refresh_running().await.unwrap();
    assert_eq!(registry.running().len(), 1);
    registry.check_invariants().unwrap();
}

#[tokio::test]
async fn poll_during_pending_shutdown_does_not_resurrect() {
    let (backend, registry) = setup(manual()).await;
    let handle = registry.start("/a", StartOptions::default()).await.unwrap();
    let name = handle.name().to_string();
    let mut rx = registry.subscribe();

    backend.hold_shutdowns();
    let task = {
        let registry = registry.clone();
        let name = name.clone();
        tokio::spawn(async move { registry.shutdown(&name).await })
    };
    while backend.calls(Operation::Shutdown) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(expect_event(&mut rx).is_empty());

    registry.refresh_running().await.unwrap();
    expect_quiet(&mut rx);
    assert!(registry.running().is_empty());

    backend.release_shutdowns();
    task.await.unwrap();
    registry.check_invariants().unwrap();
}

#[tokio::test]
async fn pessimistic_shutdown_all_emits_single_event() {
    let config = RegistryConfig {
        optimistic_shutdown: false,
        ..manual()
    };
    let (backend, registry) = setup(config).await;
    let a = registry.start("/a", StartOptions::default()).await.unwrap();
    let b = registry.start("/b", StartOptions::default()).await.unwrap();
    let c = registry.start("/c", StartOptions::default()).await.unwrap();
    let mut rx = registry.subscribe();

    // Already gone remotely, so its shutdown is not confirmed.
    backend.terminate_externally(b.name());
    registry.shutdown_all().await;

    assert_eq!(expect_event(&mut rx), vec![b.model().clone()]);
    expect_quiet(&mut rx);
    assert_eq!(backend.calls(Operation::Shutdown), 3);
    assert!(a.is_terminated() && b.is_terminated() && c.is_terminated());
    registry.check_invariants().unwrap();
}

#[tokio::test]
async fn pessimistic_shutdown_waits_for_backend() {
    let config = RegistryConfig {
        optimistic_shutdown: false,
        ..manual()
    };
    let (backend, registry) = setup(config).await;
    let ok = registry.start("/a", StartOptions::default()).await.unwrap();
    let bad = registry.start("/b", StartOptions::default()).await.unwrap();
    let mut rx = registry.subscribe();

    backend.hold_shutdowns();
    let task = {
        let registry = registry.clone();
        let name = ok.name().to_string();
        tokio::spawn(async move { registry.shutdown(&name).await })
    };
    while backend.calls(Operation::Shutdown) == 0 {
        tokio::task::yield_now().await;
    }
    expect_quiet(&mut rx);
    assert_eq!(registry.running().len(), 2);

    backend.release_shutdowns();
    task.await.unwrap();
    assert_eq!(expect_event(&mut rx), vec![bad.model().clone()]);
    assert!(ok.is_terminated());

    backend.set_failing(Operation::Shutdown, true);
    registry.shutdown(bad.name()).await;
    expect_quiet(&mut rx);
    assert_eq!(registry.running().len(), 1);
    assert!(bad.is_terminated());
    registry.check_invariants().unwrap();
}

#[tokio::test]
async fn shutdown_all_clears_with_single_event() {
    let (backend, registry) = setup(manual()).await;
    let a = registry.start("/a", StartOptions::default()).await.unwrap();
    let b = registry.start("/b", StartOptions::default()).await.unwrap();
    backend.set_running(vec![a.model().clone(), b.model().clone(), m("9", "/c")]);
    registry.refresh_running().await.unwrap();
    let mut rx = registry.subscribe();
    backend.set_failing(Operation::Shutdown, false);

    registry.shutdown_all().await;
    assert!(expect_event(&mut rx).is_empty());
    expect_quiet(&mut rx);
    assert_eq!(backend.calls(Operation::Shutdown), 3);
    assert!(a.is_terminated() && b.is_terminated());
    assert!(registry.running().is_empty());
    assert!(backend.running().is_empty());
}

#[tokio::test]
async fn shutdown_all_on_empty_list_does_nothing() {
    let (backend, registry) = setup(manual()).await;
    let mut rx = registry.subscribe();
    registry.shutdown_all().await;
    expect_quiet(&mut rx);
    assert_eq!(backend.calls(Operation::Shutdown), 0);
}

#[tokio::test]
async fn running_is_a_point_in_time_snapshot() {
    let (backend, registry) = setup(manual()).await;
    backend.set_running(vec![m("1", "/a"), m("2", "/b")]);
    registry.refresh_running().await.unwrap();

    let snapshot = registry.running();
    backend.set_running(vec![]);
    registry.refresh_running().await.unwrap();

    assert_eq!(snapshot.iter().count(), 2);
    assert_eq!(snapshot.iter().count(), 2);
    assert!(registry.running().is_empty());
}

#[tokio::test]
async fn find_by_logdir_looks_up_running_instance() {
    let (backend, registry) = setup(manual()).await;
    backend.set_running(vec![m("1", "/a"), m("2", "/b")]);
    registry.refresh_running().await.unwrap();
    assert_eq!(registry.find_by_logdir("/b").map(|m| m.name), Some("2".into()));
    assert!(registry.find_by_logdir("/c").is_none());
}

#[tokio::test]
async fn format_dir_uses_static_config() {
    let (_backend, registry) = setup(manual()).await;
    assert_eq!(registry.format_dir("/home/user/sub"), "sub");
    assert_eq!(registry.format_dir("/home/user"), WORKSPACE_ROOT_SENTINEL);
    assert_eq!(registry.format_dir("/other/path"), "/other/path");
    assert_eq!(registry.format_dir("/home/user/a,label:/home/user/b"), "a,label:b");
}

#[tokio::test]
async fn format_dir_without_static_config_is_identity() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = Registry::new(backend, manual()).await;
    assert!(registry.static_config().is_none());
    assert_eq!(registry.format_dir("/home/user/sub"), "/home/user/sub");
}

#[tokio::test(start_paused = true)]
async fn background_poll_picks_up_changes() {
    let (backend, registry) = setup(RegistryConfig::default()).await;
    let mut rx = registry.subscribe();
    backend.set_running(vec![m("1", "/a")]);

    registry.ready().await;
    assert_eq!(expect_event(&mut rx), vec![m("1", "/a")]);

    backend.set_running(vec![m("1", "/a"), m("2", "/b")]);
    let event = rx.recv().await.unwrap();
    assert_eq!(event.snapshot().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dispose_stops_events_and_clears() {
    let (backend, registry) = setup(RegistryConfig::default()).await;
    let mut rx = registry.subscribe();
    backend.set_running(vec![m("1", "/a")]);
    registry.ready().await;
    assert_eq!(expect_event(&mut rx).len(), 1);

    registry.dispose();
    registry.dispose();
    assert!(registry.is_disposed());
    assert!(registry.running().is_empty());

    let polls = backend.calls(Operation::List);
    backend.set_running(vec![m("2", "/b")]);
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(backend.calls(Operation::List), polls);
    assert_eq!(rx.recv().await.unwrap_err(), RecvError::Closed);
    assert!(registry.running().is_empty());

    let mut late = registry.subscribe();
    assert_eq!(late.recv().await.unwrap_err(), RecvError::Closed);
    assert!(matches!(
        registry.refresh_running().await,
        Err(RegistryError::Disposed)
    ));
    assert!(matches!(
        registry.start("/c", StartOptions::default()).await,
        Err(RegistryError::Disposed)
    ));
}

#[tokio::test(start_paused = true)]
async fn gate_skips_background_polls() {
    let gate = Arc::new(PendingGate::new());
    let backend = Arc::new(InMemoryBackend::new());
    let registry =
        Registry::with_poll_gate(backend.clone(), RegistryConfig::default(), gate.clone()).await;
    registry.ready().await;
    let baseline = backend.calls(Operation::List);

    let guard = gate.begin();
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(backend.calls(Operation::List), baseline);

    drop(guard);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(backend.calls(Operation::List) > baseline);
}

#[tokio::test(start_paused = true)]
async fn background_poll_failures_are_retried_next_tick() {
    let (backend, registry) = setup(RegistryConfig::default()).await;
    backend.set_failing(Operation::List, true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!registry.is_ready());

    backend.set_failing(Operation::List, false);
    tokio::time::timeout(Duration::from_secs(15), registry.ready())
        .await
        .expect("next tick succeeds");
}

#[tokio::test]
async fn concurrent_refreshes_converge() {
    let (backend, registry) = setup(manual()).await;
    backend.set_running(vec![m("1", "/a"), m("2", "/b")]);
    let mut rx = registry.subscribe();

    let results = join_all((0..4).map(|_| registry.refresh_running())).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(expect_event(&mut rx).len(), 2);
    expect_quiet(&mut rx);
    registry.check_invariants().unwrap();
}
