//! Control loop: runs the Dispatcher then the Reconciler on a fixed tick.
//!
//! Lifecycle: `Idle -> Running -> (Cancelled | Crashed)`.
//!
//! Cancellation is cooperative. The stop signal is checked between ticks and
//! after each component; an adapter call already in flight finishes and is
//! recorded before the loop exits.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ProvisioningBackend;
use crate::config::WorkerSettings;
use crate::domain::ActionId;
use crate::store::ActionStore;

use super::{Clock, Dispatcher, EngineError, Reconciler};

/// Lifecycle of a spawned loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Idle,
    Running,
    Cancelled,
    Crashed,
}

impl LoopState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LoopState::Cancelled | LoopState::Crashed)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Actions started on the backend
    pub dispatched: Vec<ActionId>,
    /// Actions whose persisted state changed
    pub reconciled: Vec<ActionId>,
    /// Tick stopped early because the store was unavailable
    pub aborted: bool,
}

pub struct ControlLoop {
    store: Arc<dyn ActionStore>,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    settings: WorkerSettings,
}

impl ControlLoop {
    pub fn new(
        store: Arc<dyn ActionStore>,
        backend: Arc<dyn ProvisioningBackend>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(store.clone(), backend.clone(), clock.clone(), &settings),
            reconciler: Reconciler::new(store.clone(), backend, clock, &settings),
            store,
            settings,
        }
    }

    /// Run a single dispatch + reconcile pass
    pub async fn tick(&self) -> TickReport {
        self.run_tick(None).await
    }

    #[instrument(skip(self, stop))]
    async fn run_tick(&self, stop: Option<&watch::Receiver<bool>>) -> TickReport {
        let mut report = TickReport::default();
        let batch_size = self.settings.batch_size;

        match self.dispatcher.dispatch(batch_size).await {
            Ok(ids) => report.dispatched = ids,
            Err(e) => {
                warn!(error = %e, "Dispatch aborted, retrying next tick");
                report.aborted = true;
                return report;
            }
        }

        if stop.is_some_and(|s| *s.borrow()) {
            return report;
        }

        match self.reconciler.reconcile(batch_size).await {
            Ok(ids) => report.reconciled = ids,
            Err(e) => {
                warn!(error = %e, "Reconcile aborted, retrying next tick");
                report.aborted = true;
            }
        }

        report
    }

    /// Start the loop on a background task
    pub fn spawn(self) -> LoopHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        let task = tokio::spawn(self.run(stop_rx, state_tx));

        LoopHandle {
            stop: stop_tx,
            state: state_rx,
            task,
        }
    }

    /// Loop until stopped; returns the number of ticks run
    async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        state: watch::Sender<LoopState>,
    ) -> Result<u64, EngineError> {
        if let Err(e) = self.store.ping().await {
            error!(error = %e, "Store unreachable at startup, not starting");
            state.send_replace(LoopState::Crashed);
            return Err(e.into());
        }

        state.send_replace(LoopState::Running);
        info!(
            tick_interval_ms = self.settings.tick_interval_ms,
            batch_size = self.settings.batch_size,
            "Control loop started"
        );

        let interval = self.settings.tick_interval();
        let mut ticks: u64 = 0;

        loop {
            if *stop.borrow() {
                break;
            }

            let report = self.run_tick(Some(&stop)).await;
            ticks += 1;
            if !report.dispatched.is_empty() || !report.reconciled.is_empty() {
                debug!(
                    tick = ticks,
                    dispatched = report.dispatched.len(),
                    reconciled = report.reconciled.len(),
                    "Tick finished"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop.changed() => {
                    // Handle dropped without an explicit stop
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        state.send_replace(LoopState::Cancelled);
        info!(ticks, "Control loop stopped");
        Ok(ticks)
    }
}

/// Handle to a spawned [`ControlLoop`]. Dropping it stops the loop.
pub struct LoopHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<Result<u64, EngineError>>,
}

impl LoopHandle {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `target` or stops
    pub async fn wait_for(&mut self, target: LoopState) -> LoopState {
        loop {
            let current = *self.state.borrow_and_update();
            if current == target || current.is_stopped() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }

    /// Ask the loop to stop after the current step
    pub fn cancel(&self) {
        self.stop.send_replace(true);
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(self) -> Result<u64, EngineError> {
        self.cancel();
        self.join().await
    }

    /// Wait for the loop to exit on its own
    pub async fn join(self) -> Result<u64, EngineError> {
        let LoopHandle { stop, task, .. } = self;
        let result = task.await?;
        drop(stop);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_states() {
        assert!(!LoopState::Idle.is_stopped());
        assert!(!LoopState::Running.is_stopped());
        assert!(LoopState::Cancelled.is_stopped());
        assert!(LoopState::Crashed.is_stopped());
    }
}
