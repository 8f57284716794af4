//! Dispatcher: claims QUEUED actions and starts backend work.
//!
//! The claim always happens before the backend is called. A failed start
//! rolls the claim back to QUEUED with the retry counter bumped; once the
//! retries are used up the action fails with `dispatch-exhausted`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::adapters::{Handle, ProvisioningBackend};
use crate::config::WorkerSettings;
use crate::domain::{Action, ActionId, ActionStatus, FailureReason};
use crate::store::{ActionStore, Transition};

use super::{Clock, EngineError};

pub struct Dispatcher {
    store: Arc<dyn ActionStore>,
    backend: Arc<dyn ProvisioningBackend>,
    clock: Arc<dyn Clock>,
    max_dispatch_retries: u32,
    adapter_timeout: Duration,
}

impl Dispatcher {
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
            max_dispatch_retries: settings.max_dispatch_retries,
            adapter_timeout: settings.adapter_timeout(),
        }
    }

    /// Claim up to `batch_size` QUEUED actions and start each on the backend.
    ///
    /// Returns the ids whose start was accepted and recorded this cycle.
    /// Only an unavailable store fails the whole call; anything else is
    /// contained to the action it happened on.
    #[instrument(skip(self), fields(backend = %self.backend.name()))]
    pub async fn dispatch(&self, batch_size: usize) -> Result<Vec<ActionId>, EngineError> {
        let claimed = self
            .store
            .claim_queued(batch_size, self.clock.now())
            .await?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = claimed.len(), "Claimed queued actions");

        let mut dispatched = Vec::with_capacity(claimed.len());
        for action in &claimed {
            match self.start(action).await {
                Ok(()) => dispatched.push(action.id),
                Err(e) if e.aborts_tick() => return Err(e),
                Err(EngineError::ClaimConflict(id)) => {
                    debug!(action_id = id, "Action changed hands after claim, skipping");
                }
                Err(e) => {
                    warn!(action_id = action.id, error = %e, "Dispatch failed");
                }
            }
        }

        Ok(dispatched)
    }

    async fn start(&self, action: &Action) -> Result<(), EngineError> {
        match self.call_start(action).await {
            Ok(handle) => {
                info!(action_id = action.id, kind = %action.kind, %handle, "Started action");
                let recorded = self
                    .store
                    .commit_transition(action.id, ActionStatus::Running, Transition::RecordHandle(handle))
                    .await?;
                if !recorded {
                    return Err(EngineError::ClaimConflict(action.id));
                }
                Ok(())
            }
            Err(failure) => {
                self.roll_back(action).await?;
                Err(failure)
            }
        }
    }

    /// The backend start, bounded by the adapter timeout
    async fn call_start(&self, action: &Action) -> Result<Handle, EngineError> {
        let failure = |message: String| EngineError::AdapterStartFailure {
            action_id: action.id,
            message,
        };

        match tokio::time::timeout(self.adapter_timeout, self.backend.start_provisioning(action)).await
        {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(failure(format!("{:#}", e))),
            Err(_) => Err(failure(format!(
                "no response within {}ms",
                self.adapter_timeout.as_millis()
            ))),
        }
    }

    /// Undo a claim whose start failed
    async fn roll_back(&self, action: &Action) -> Result<(), EngineError> {
        let attempts = action.dispatch_attempts.saturating_add(1);

        let transition = if attempts > self.max_dispatch_retries {
            warn!(action_id = action.id, attempts, "Dispatch retries exhausted");
            Transition::Fail {
                finished_at: self.clock.now(),
                reason: FailureReason::DispatchExhausted,
                dispatch_attempts: Some(attempts),
            }
        } else {
            info!(action_id = action.id, attempts, "Returning action to queue");
            Transition::Requeue {
                dispatch_attempts: attempts,
            }
        };

        if !self
            .store
            .commit_transition(action.id, ActionStatus::Running, transition)
            .await?
        {
            return Err(EngineError::ClaimConflict(action.id));
        }
        Ok(())
    }
}
