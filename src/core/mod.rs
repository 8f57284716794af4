//! Reconciliation engine.
//!
//! This module contains:
//! - Clock: Injectable time source
//! - Dispatcher: Claims QUEUED actions and starts backend work
//! - Reconciler: Polls RUNNING actions and finalizes them
//! - ControlLoop: Drives dispatch and reconcile on a fixed tick

pub mod clock;
pub mod control_loop;
pub mod dispatcher;
pub mod reconciler;

use thiserror::Error;

use crate::domain::ActionId;
use crate::store::StoreError;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use control_loop::{ControlLoop, LoopHandle, LoopState, TickReport};
pub use dispatcher::Dispatcher;
pub use reconciler::Reconciler;

/// Errors raised while driving actions
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Action {0} was claimed by another worker")]
    ClaimConflict(ActionId),

    #[error("Backend failed to start action {action_id}: {message}")]
    AdapterStartFailure { action_id: ActionId, message: String },

    #[error("Backend poll failed for action {action_id}: {message}")]
    AdapterPollFailure { action_id: ActionId, message: String },

    #[error("Action {action_id} stuck for {elapsed_ms}ms (limit {limit_ms}ms)")]
    StuckTimeout {
        action_id: ActionId,
        elapsed_ms: i64,
        limit_ms: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Control loop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Whether the current tick should stop instead of moving to the next action
    pub fn aborts_tick(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_unavailable())
    }
}
