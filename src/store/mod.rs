//! Durable record of actions and servers.
//!
//! The engine treats the store as a transactional key space. Every state
//! change goes through one of two compare-and-swap primitives:
//! - [`ActionStore::claim`]: QUEUED -> RUNNING, the only way work is acquired
//! - [`ActionStore::commit_transition`]: everything after the claim, applied
//!   only if the action is still in the expected status
//!
//! A `false` return from either means another worker got there first.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::adapters::Handle;
use crate::domain::{
    Action, ActionId, ActionKind, ActionStatus, FailureReason, Server, ServerId, ServerSpec,
};

pub use memory::MemoryActionStore;
pub use sqlite::SqliteActionStore;

/// Errors that can occur in the action store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid transition for action {id}: {from} -> {to}")]
    InvalidTransition {
        id: ActionId,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the store as a whole is unreachable, as opposed to one record
    /// being unusable. Unavailability aborts the current tick.
    pub fn is_unavailable(&self) -> bool {
        use rusqlite::ErrorCode;

        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::DiskFull
                        | ErrorCode::ReadOnly
                )
            ),
            _ => false,
        }
    }
}

/// Server fields the engine may write on completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPatch {
    pub ipv4_address: Option<String>,
    pub is_deprovisioned: Option<bool>,
}

impl ServerPatch {
    pub fn is_empty(&self) -> bool {
        self.ipv4_address.is_none() && self.is_deprovisioned.is_none()
    }

    pub fn apply(&self, server: &mut Server) {
        if let Some(address) = &self.ipv4_address {
            server.ipv4_address = Some(address.clone());
        }
        if let Some(flag) = self.is_deprovisioned {
            server.is_deprovisioned = flag;
        }
    }
}

/// A post-claim state change, applied atomically with its server patch
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// RUNNING -> RUNNING: backend accepted the start
    RecordHandle(Handle),

    /// RUNNING -> RUNNING: progress hint, never lowered
    Progress(u8),

    /// RUNNING -> QUEUED: adapter start failed, undo the claim
    Requeue { dispatch_attempts: u32 },

    /// RUNNING -> COMPLETED
    Complete {
        finished_at: DateTime<Utc>,
        server: ServerPatch,
    },

    /// RUNNING -> FAILED, no server side effects
    Fail {
        finished_at: DateTime<Utc>,
        reason: FailureReason,
        dispatch_attempts: Option<u32>,
    },
}

impl Transition {
    pub fn target_status(&self) -> ActionStatus {
        match self {
            Transition::RecordHandle(_) | Transition::Progress(_) => ActionStatus::Running,
            Transition::Requeue { .. } => ActionStatus::Queued,
            Transition::Complete { .. } => ActionStatus::Completed,
            Transition::Fail { .. } => ActionStatus::Failed,
        }
    }

    /// Server fields to write in the same commit
    pub fn server_patch(&self) -> Option<&ServerPatch> {
        match self {
            Transition::Complete { server, .. } if !server.is_empty() => Some(server),
            _ => None,
        }
    }

    /// Apply to an action already known to be in its expected status
    pub fn apply(&self, action: &mut Action) -> Result<(), StoreError> {
        let to = self.target_status();
        if !action.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: action.id,
                from: action.status,
                to,
            });
        }

        match self {
            Transition::RecordHandle(handle) => {
                action.handle = Some(handle.clone());
            }
            Transition::Progress(percent) => {
                action.progress = action.progress.max((*percent).min(100));
            }
            Transition::Requeue { dispatch_attempts } => {
                action.status = ActionStatus::Queued;
                action.dispatch_attempts = *dispatch_attempts;
                action.started_at = None;
                action.handle = None;
                action.progress = 0;
            }
            Transition::Complete { finished_at, .. } => {
                action.status = ActionStatus::Completed;
                action.progress = 100;
                action.finished_at = Some(clamp_finish(action, *finished_at));
            }
            Transition::Fail {
                finished_at,
                reason,
                dispatch_attempts,
            } => {
                action.status = ActionStatus::Failed;
                action.finished_at = Some(clamp_finish(action, *finished_at));
                action.failure_reason = Some(reason.to_string());
                if let Some(attempts) = dispatch_attempts {
                    action.dispatch_attempts = *attempts;
                }
            }
        }

        Ok(())
    }
}

/// `finished_at` never precedes `started_at`, even across skewed clocks
fn clamp_finish(action: &Action, finished_at: DateTime<Utc>) -> DateTime<Utc> {
    match action.started_at {
        Some(started_at) if finished_at < started_at => started_at,
        _ => finished_at,
    }
}

/// Storage for actions and the servers they target
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Cheap reachability probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Up to `limit` claimable QUEUED actions, oldest first.
    ///
    /// Actions the identity rule currently blocks are left out, so they never
    /// take batch slots from actions on other servers.
    async fn select_queued(&self, limit: usize) -> Result<Vec<Action>, StoreError>;

    /// Atomically move a QUEUED action to RUNNING and stamp `started_at`.
    ///
    /// Returns false if the action is no longer QUEUED, or if it mutates
    /// server identity while another such action on the same server is RUNNING.
    async fn claim(&self, id: ActionId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Select and claim up to `limit` QUEUED actions, returning those won
    async fn claim_queued(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Action>, StoreError> {
        let mut claimed = Vec::new();
        for mut action in self.select_queued(limit).await? {
            if self.claim(action.id, now).await? {
                action.status = ActionStatus::Running;
                action.started_at = Some(now);
                claimed.push(action);
            } else {
                tracing::debug!(action_id = action.id, "Claim lost, skipping");
            }
        }
        Ok(claimed)
    }

    /// Up to `limit` RUNNING actions, oldest-started first
    async fn select_running(&self, limit: usize) -> Result<Vec<Action>, StoreError>;

    /// Apply `transition` if the action is still in `expected`.
    ///
    /// The action update and its server patch commit together or not at all.
    async fn commit_transition(
        &self,
        id: ActionId,
        expected: ActionStatus,
        transition: Transition,
    ) -> Result<bool, StoreError>;

    async fn create_server(&self, spec: ServerSpec, now: DateTime<Utc>)
        -> Result<Server, StoreError>;

    /// Record a new QUEUED action against an existing server
    async fn enqueue(
        &self,
        server_id: ServerId,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError>;

    async fn get_action(&self, id: ActionId) -> Result<Option<Action>, StoreError>;

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, StoreError>;

    /// Most recent first
    async fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<Action>, StoreError>;
}
