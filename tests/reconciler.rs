//! Reconciler Integration Tests
//!
//! Tests for progress tracking, stuck-timeout handling, poll failures and
//! handle recovery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Notify;
use xcloud_worker::adapters::{
    Handle, ProgressReport, ProvisioningBackend, Script, ScriptedBackend, ScriptedPoll,
};
use xcloud_worker::config::WorkerSettings;
use xcloud_worker::core::{Clock, Dispatcher, ManualClock, Reconciler};
use xcloud_worker::domain::{Action, ActionKind, ActionStatus, ResourceOutcome, Server, ServerSpec};
use xcloud_worker::store::{ActionStore, MemoryActionStore};

const STUCK_TIMEOUT_MS: u64 = 60_000;

struct Harness {
    store: Arc<MemoryActionStore>,
    backend: Arc<ScriptedBackend>,
    clock: Arc<ManualClock>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryActionStore::new());
        let backend = Arc::new(ScriptedBackend::new());
        let clock = Arc::new(ManualClock::default());
        let settings = WorkerSettings {
            stuck_timeout_ms: STUCK_TIMEOUT_MS,
            ..Default::default()
        };

        Self {
            dispatcher: Dispatcher::new(store.clone(), backend.clone(), clock.clone(), &settings),
            reconciler: Reconciler::new(store.clone(), backend.clone(), clock.clone(), &settings),
            store,
            backend,
            clock,
        }
    }

    async fn server(&self) -> Server {
        self.store
            .create_server(
                ServerSpec {
                    name: "web-1".to_string(),
                    image: "redhat-9.0".to_string(),
                    server_type: "linux-small".to_string(),
                    datacenter: "fra1".to_string(),
                },
                self.clock.now(),
            )
            .await
            .unwrap()
    }

    /// Queue an action with `script` and dispatch it
    async fn running(&self, kind: ActionKind, script: Script) -> Action {
        let server = self.server().await;
        let action = self
            .store
            .enqueue(server.id, kind, self.clock.now())
            .await
            .unwrap();
        self.backend.script(action.id, script);
        assert_eq!(self.dispatcher.dispatch(10).await.unwrap(), vec![action.id]);
        self.get(&action).await
    }

    async fn get(&self, action: &Action) -> Action {
        self.store.get_action(action.id).await.unwrap().unwrap()
    }
}

/// Longer than the default adapter timeout, well short of the stuck-timeout
fn past_start_grace() -> Duration {
    Duration::seconds(31)
}

fn in_progress(percent: u8) -> ScriptedPoll {
    ScriptedPoll::Report(ProgressReport::InProgress(percent))
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let h = Harness::new();
    let action = h
        .running(
            ActionKind::ModifyServer,
            Script::polls(vec![
                in_progress(30),
                in_progress(10),
                in_progress(60),
                ScriptedPoll::Report(ProgressReport::Done(ResourceOutcome::default())),
            ]),
        )
        .await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        h.reconciler.reconcile(10).await.unwrap();
        let stored = h.get(&action).await;
        assert_eq!(stored.status, ActionStatus::Running);
        seen.push(stored.progress);
    }
    assert_eq!(seen, vec![30, 30, 60]);

    assert_eq!(h.reconciler.reconcile(10).await.unwrap(), vec![action.id]);
    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Completed);
    assert_eq!(stored.progress, 100);

    // Frozen once terminal
    assert!(h.reconciler.reconcile(10).await.unwrap().is_empty());
    assert_eq!(h.get(&action).await, stored);
}

#[tokio::test]
async fn test_unchanged_progress_is_not_reported() {
    let h = Harness::new();
    let action = h
        .running(ActionKind::ModifyServer, Script::polls(vec![in_progress(0)]))
        .await;

    assert!(h.reconciler.reconcile(10).await.unwrap().is_empty());
    assert_eq!(h.get(&action).await.progress, 0);
    assert_eq!(h.backend.poll_calls(action.id), 1);
}

#[tokio::test]
async fn test_stuck_action_times_out() {
    let h = Harness::new();
    let action = h
        .running(ActionKind::CreateServer, Script::unresponsive())
        .await;

    // Exactly at the limit: still polled, still RUNNING
    h.clock.advance(Duration::milliseconds(STUCK_TIMEOUT_MS as i64));
    assert!(h.reconciler.reconcile(10).await.unwrap().is_empty());
    assert_eq!(h.get(&action).await.status, ActionStatus::Running);
    assert_eq!(h.backend.poll_calls(action.id), 1);

    h.clock.advance(Duration::milliseconds(1));
    assert_eq!(h.reconciler.reconcile(10).await.unwrap(), vec![action.id]);

    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(stored.finished_at, Some(h.clock.now()));
    assert!(stored.is_finished());

    // The timed-out job was not polled again
    assert_eq!(h.backend.poll_calls(action.id), 1);
}

#[tokio::test]
async fn test_late_backend_result_is_discarded() {
    let h = Harness::new();
    let action = h
        .running(
            ActionKind::CreateServer,
            Script::done_after(1, ResourceOutcome::with_ipv4("10.10.10.10")),
        )
        .await;

    h.clock
        .advance(Duration::milliseconds(STUCK_TIMEOUT_MS as i64 + 1));
    h.reconciler.reconcile(10).await.unwrap();
    h.reconciler.reconcile(10).await.unwrap();

    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(h.backend.poll_calls(action.id), 0);

    let server = h
        .store
        .get_server(action.target_server_id)
        .await
        .unwrap()
        .unwrap();
    assert!(server.ipv4_address.is_none());
}

#[tokio::test]
async fn test_poll_failure_keeps_action_running() {
    let h = Harness::new();
    let action = h
        .running(
            ActionKind::CreateServer,
            Script::polls(vec![
                in_progress(40),
                ScriptedPoll::Error("503 Service Unavailable".to_string()),
                ScriptedPoll::Report(ProgressReport::Done(ResourceOutcome::with_ipv4("10.0.0.5"))),
            ]),
        )
        .await;

    h.reconciler.reconcile(10).await.unwrap();
    assert!(h.reconciler.reconcile(10).await.unwrap().is_empty());

    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Running);
    assert_eq!(stored.progress, 40);
    assert!(stored.finished_at.is_none());

    assert_eq!(h.reconciler.reconcile(10).await.unwrap(), vec![action.id]);
    assert_eq!(h.get(&action).await.status, ActionStatus::Completed);
}

#[tokio::test]
async fn test_poll_failure_does_not_block_siblings() {
    let h = Harness::new();
    let broken = h
        .running(ActionKind::CreateServer, Script::unresponsive())
        .await;
    let healthy = h
        .running(
            ActionKind::CreateServer,
            Script::done_after(1, ResourceOutcome::with_ipv4("10.0.0.9")),
        )
        .await;

    assert_eq!(h.reconciler.reconcile(10).await.unwrap(), vec![healthy.id]);
    assert_eq!(h.get(&broken).await.status, ActionStatus::Running);
    assert_eq!(h.get(&healthy).await.status, ActionStatus::Completed);
}

#[tokio::test]
async fn test_backend_failure_leaves_server_untouched() {
    let h = Harness::new();
    let action = h
        .running(ActionKind::DeleteServer, Script::failing("quota"))
        .await;

    h.reconciler.reconcile(10).await.unwrap();

    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("quota"));

    let server = h
        .store
        .get_server(action.target_server_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!server.is_deprovisioned);
}

#[tokio::test]
async fn test_missing_handle_restarted_with_same_key() {
    let h = Harness::new();
    let server = h.server().await;
    let action = h
        .store
        .enqueue(server.id, ActionKind::CreateServer, h.clock.now())
        .await
        .unwrap();

    // Claimed, then the worker died before starting the backend job
    assert!(h.store.claim(action.id, h.clock.now()).await.unwrap());
    h.clock.advance(past_start_grace());

    assert_eq!(h.reconciler.reconcile(10).await.unwrap(), vec![action.id]);
    let stored = h.get(&action).await;
    assert_eq!(stored.status, ActionStatus::Running);
    assert!(stored.handle.is_some());
    assert_eq!(h.backend.successful_starts(action.id), 1);

    h.reconciler.reconcile(10).await.unwrap();
    assert_eq!(h.get(&action).await.status, ActionStatus::Completed);
}

#[tokio::test]
async fn test_missing_handle_found_on_backend() {
    let h = Harness::new();
    let server = h.server().await;
    let action = h
        .store
        .enqueue(server.id, ActionKind::CreateServer, h.clock.now())
        .await
        .unwrap();
    assert!(h.store.claim(action.id, h.clock.now()).await.unwrap());

    // Backend job started, but the handle never reached the store
    let claimed = h.get(&action).await;
    let handle = h.backend.start_provisioning(&claimed).await.unwrap();
    h.clock.advance(past_start_grace());

    h.reconciler.reconcile(10).await.unwrap();
    let stored = h.get(&action).await;
    assert_eq!(stored.handle, Some(handle));
    assert_eq!(h.backend.start_calls(action.id), 1);
}

#[tokio::test]
async fn test_fresh_claim_without_handle_is_left_alone() {
    let h = Harness::new();
    let server = h.server().await;
    let action = h
        .store
        .enqueue(server.id, ActionKind::CreateServer, h.clock.now())
        .await
        .unwrap();
    assert!(h.store.claim(action.id, h.clock.now()).await.unwrap());
    let claimed = h.get(&action).await;

    h.clock.advance(Duration::seconds(30));
    assert!(h.reconciler.reconcile(10).await.unwrap().is_empty());
    assert_eq!(h.backend.start_calls(action.id), 0);
    assert_eq!(h.get(&action).await, claimed);
}

/// Backend whose starts block until released
struct GatedBackend {
    inner: ScriptedBackend,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ProvisioningBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    async fn start_provisioning(&self, action: &Action) -> anyhow::Result<Handle> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.start_provisioning(action).await
    }

    async fn poll_status(&self, handle: &Handle) -> anyhow::Result<ProgressReport> {
        self.inner.poll_status(handle).await
    }

    async fn find_handle(&self, action: &Action) -> anyhow::Result<Option<Handle>> {
        self.inner.find_handle(action).await
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_other_loop_does_not_restart_in_flight_start() {
    let store = Arc::new(MemoryActionStore::new());
    let clock = Arc::new(ManualClock::default());
    let backend = Arc::new(GatedBackend {
        inner: ScriptedBackend::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let settings = WorkerSettings::default();

    let server = store
        .create_server(
            ServerSpec {
                name: "web-1".to_string(),
                image: "redhat-9.0".to_string(),
                server_type: "linux-small".to_string(),
                datacenter: "fra1".to_string(),
            },
            clock.now(),
        )
        .await
        .unwrap();
    let action = store
        .enqueue(server.id, ActionKind::CreateServer, clock.now())
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), backend.clone(), clock.clone(), &settings);
    let dispatch = tokio::spawn(async move { dispatcher.dispatch(10).await });
    backend.entered.notified().await;

    // A second loop reconciles while the first loop's start is outstanding
    let other = Reconciler::new(store.clone(), backend.clone(), clock.clone(), &settings);
    assert!(other.reconcile(10).await.unwrap().is_empty());

    backend.release.notify_one();
    assert_eq!(dispatch.await.unwrap().unwrap(), vec![action.id]);

    assert_eq!(backend.inner.start_calls(action.id), 1);
    let stored = store.get_action(action.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ActionStatus::Running);
    assert!(stored.handle.is_some());
}
