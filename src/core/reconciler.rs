//! Reconciler: polls RUNNING actions and applies what the backend reports.
//!
//! Per action, in order:
//! 1. Past the stuck-timeout -> FAILED("timeout"), backend not consulted
//! 2. No handle recorded -> once the dispatcher's start has had its full
//!    adapter timeout, recover the handle from the backend and persist it
//! 3. Otherwise poll, and commit progress, completion or failure
//!
//! Completion writes the server side effect in the same commit as the status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{Handle, ProgressReport, ProvisioningBackend};
use crate::config::WorkerSettings;
use crate::domain::{Action, ActionId, ActionKind, ActionStatus, FailureReason, ResourceOutcome};
use crate::store::{ActionStore, ServerPatch, Transition};

use super::{Clock, EngineError};

pub struct Reconciler {
    store: Arc<dyn ActionStore>,
    backend: Arc<dyn ProvisioningBackend>,
    clock: Arc<dyn Clock>,
    stuck_timeout: chrono::Duration,
    adapter_timeout: Duration,
    start_grace: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ActionStore>,
        backend: Arc<dyn ProvisioningBackend>,
        clock: Arc<dyn Clock>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            store,
            backend,
            clock,
            stuck_timeout: settings.stuck_timeout(),
            adapter_timeout: settings.adapter_timeout(),
            start_grace: settings.start_grace(),
        }
    }

    /// Poll up to `batch_size` RUNNING actions, oldest-started first.
    ///
    /// Returns the ids whose persisted state changed this cycle.
    #[instrument(skip(self), fields(backend = %self.backend.name()))]
    pub async fn reconcile(&self, batch_size: usize) -> Result<Vec<ActionId>, EngineError> {
        let running = self.store.select_running(batch_size).await?;

        let mut updated = Vec::new();
        for action in &running {
            match self.reconcile_one(action).await {
                Ok(true) => updated.push(action.id),
                Ok(false) => {}
                Err(e) if e.aborts_tick() => return Err(e),
                Err(e @ EngineError::AdapterPollFailure { .. }) => {
                    debug!(action_id = action.id, error = %e, "Poll failed, retrying next tick");
                }
                Err(e) => {
                    warn!(action_id = action.id, error = %e, "Reconcile failed");
                }
            }
        }

        Ok(updated)
    }

    async fn reconcile_one(&self, action: &Action) -> Result<bool, EngineError> {
        let now = self.clock.now();

        if let Some(elapsed) = self.overdue(action, now) {
            let timeout = EngineError::StuckTimeout {
                action_id: action.id,
                elapsed_ms: elapsed.num_milliseconds(),
                limit_ms: self.stuck_timeout.num_milliseconds(),
            };
            warn!(action_id = action.id, error = %timeout, "Failing orphaned action");
            return self
                .commit(
                    action,
                    Transition::Fail {
                        finished_at: now,
                        reason: FailureReason::Timeout,
                        dispatch_attempts: None,
                    },
                )
                .await;
        }

        let Some(handle) = &action.handle else {
            if self.start_in_flight(action, now) {
                debug!(action_id = action.id, "No handle yet, start may still be in flight");
                return Ok(false);
            }
            return self.recover_handle(action).await;
        };

        let report = self.poll(action, handle).await?;
        match report {
            ProgressReport::InProgress(percent) => {
                let percent = percent.min(100);
                if percent <= action.progress {
                    return Ok(false);
                }
                self.commit(action, Transition::Progress(percent)).await
            }
            ProgressReport::Done(outcome) => {
                info!(action_id = action.id, kind = %action.kind, "Action completed");
                self.commit(
                    action,
                    Transition::Complete {
                        finished_at: self.clock.now(),
                        server: completion_patch(action.kind, outcome),
                    },
                )
                .await
            }
            ProgressReport::Failed(reason) => {
                warn!(action_id = action.id, kind = %action.kind, %reason, "Action failed on backend");
                self.commit(
                    action,
                    Transition::Fail {
                        finished_at: self.clock.now(),
                        reason: FailureReason::Backend(reason),
                        dispatch_attempts: None,
                    },
                )
                .await
            }
        }
    }

    /// Elapsed time since the claim, if it exceeds the stuck-timeout
    fn overdue(&self, action: &Action, now: DateTime<Utc>) -> Option<chrono::Duration> {
        // A RUNNING row without started_at is malformed; treat it as just claimed
        let started_at = action.started_at?;
        let elapsed = now - started_at;
        (elapsed > self.stuck_timeout).then_some(elapsed)
    }

    /// A claim younger than one adapter timeout may still have its dispatcher
    /// start outstanding, possibly in another loop.
    fn start_in_flight(&self, action: &Action, now: DateTime<Utc>) -> bool {
        action
            .started_at
            .is_some_and(|started_at| now - started_at <= self.start_grace)
    }

    async fn poll(&self, action: &Action, handle: &Handle) -> Result<ProgressReport, EngineError> {
        let failure = |message: String| EngineError::AdapterPollFailure {
            action_id: action.id,
            message,
        };

        match tokio::time::timeout(self.adapter_timeout, self.backend.poll_status(handle)).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(failure(format!("{:#}", e))),
            Err(_) => Err(failure(format!(
                "no response within {}ms",
                self.adapter_timeout.as_millis()
            ))),
        }
    }

    /// Recover the handle of a RUNNING action that lost it, e.g. after a crash
    /// between the backend start and the local commit.
    ///
    /// Asks the backend first; if it has no job either, re-sends the start with
    /// the same dispatch key.
    async fn recover_handle(&self, action: &Action) -> Result<bool, EngineError> {
        let failure = |message: String| EngineError::AdapterPollFailure {
            action_id: action.id,
            message,
        };

        let found = match tokio::time::timeout(self.adapter_timeout, self.backend.find_handle(action)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => return Err(failure(format!("handle lookup failed: {:#}", e))),
            Err(_) => return Err(failure("handle lookup timed out".to_string())),
        };

        let handle = match found {
            Some(handle) => handle,
            None => {
                match tokio::time::timeout(self.adapter_timeout, self.backend.start_provisioning(action))
                    .await
                {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(e)) => return Err(failure(format!("restart failed: {:#}", e))),
                    Err(_) => return Err(failure("restart timed out".to_string())),
                }
            }
        };

        info!(action_id = action.id, %handle, "Recovered backend handle");
        self.commit(action, Transition::RecordHandle(handle)).await
    }

    /// Commit against RUNNING; a lost race is logged and reported as no change
    async fn commit(&self, action: &Action, transition: Transition) -> Result<bool, EngineError> {
        let committed = self
            .store
            .commit_transition(action.id, ActionStatus::Running, transition)
            .await?;

        if !committed {
            debug!(action_id = action.id, "Action no longer RUNNING, discarding result");
        }
        Ok(committed)
    }
}

/// Server side effect of a successful action
fn completion_patch(kind: ActionKind, outcome: ResourceOutcome) -> ServerPatch {
    match kind {
        ActionKind::CreateServer => ServerPatch {
            ipv4_address: outcome.ipv4_address,
            ..Default::default()
        },
        ActionKind::DeleteServer => ServerPatch {
            is_deprovisioned: Some(true),
            ..Default::default()
        },
        ActionKind::ModifyServer => ServerPatch::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_patch_per_kind() {
        let outcome = ResourceOutcome::with_ipv4("10.10.10.10");

        let create = completion_patch(ActionKind::CreateServer, outcome.clone());
        assert_eq!(create.ipv4_address.as_deref(), Some("10.10.10.10"));
        assert_eq!(create.is_deprovisioned, None);

        let delete = completion_patch(ActionKind::DeleteServer, outcome.clone());
        assert_eq!(delete.ipv4_address, None);
        assert_eq!(delete.is_deprovisioned, Some(true));

        assert!(completion_patch(ActionKind::ModifyServer, outcome).is_empty());
    }

    #[test]
    fn test_create_without_address_has_no_patch() {
        assert!(completion_patch(ActionKind::CreateServer, ResourceOutcome::default()).is_empty());
    }
}
