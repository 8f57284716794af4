//! Action records and their lifecycle.
//!
//! An action moves strictly forward through
//! `QUEUED -> RUNNING -> {COMPLETED | FAILED}`. The only backwards edge is the
//! dispatcher's rollback of a claim whose adapter start failed, which returns a
//! RUNNING action to QUEUED before any backend work exists for it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::server::ServerId;
use crate::adapters::Handle;

pub type ActionId = i64;

/// What an action does to its target server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    CreateServer,
    DeleteServer,
    ModifyServer,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateServer => "CREATE_SERVER",
            ActionKind::DeleteServer => "DELETE_SERVER",
            ActionKind::ModifyServer => "MODIFY_SERVER",
        }
    }

    /// Kinds that change a server's identity fields (address, lifecycle flag).
    /// At most one of these may be RUNNING per server.
    pub fn mutates_identity(&self) -> bool {
        matches!(self, ActionKind::CreateServer | ActionKind::DeleteServer)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_SERVER" => Ok(ActionKind::CreateServer),
            "DELETE_SERVER" => Ok(ActionKind::DeleteServer),
            "MODIFY_SERVER" => Ok(ActionKind::ModifyServer),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

/// Lifecycle status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Recorded by the request layer, not yet claimed
    Queued,

    /// Claimed by a worker, backend work in flight
    Running,

    /// Backend reported success, side effects applied
    Completed,

    /// Backend failure, dispatch exhaustion or stuck timeout
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Queued => "QUEUED",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Completed => "COMPLETED",
            ActionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Running, Running)
                | (Running, Queued)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl Default for ActionStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(ActionStatus::Queued),
            "RUNNING" => Ok(ActionStatus::Running),
            "COMPLETED" => Ok(ActionStatus::Completed),
            "FAILED" => Ok(ActionStatus::Failed),
            other => Err(format!("unknown action status: {}", other)),
        }
    }
}

/// Why an action ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// RUNNING past the stuck timeout without a terminal poll result
    Timeout,

    /// Adapter start failed more often than the retry budget allows
    DispatchExhausted,

    /// Reason reported by the backend
    Backend(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::DispatchExhausted => "dispatch-exhausted",
            FailureReason::Backend(reason) => reason,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded unit of provisioning intent
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: ActionId,

    pub kind: ActionKind,

    pub status: ActionStatus,

    /// 0-100, UI hint only
    pub progress: u8,

    /// FIFO key for dispatch
    pub created_at: DateTime<Utc>,

    /// Set by the claim (QUEUED -> RUNNING)
    pub started_at: Option<DateTime<Utc>>,

    /// Set by the terminal transition
    pub finished_at: Option<DateTime<Utc>>,

    pub target_server_id: ServerId,

    /// Backend handle, present once the adapter start succeeded
    pub handle: Option<Handle>,

    /// Failed adapter starts so far
    pub dispatch_attempts: u32,

    pub failure_reason: Option<String>,
}

impl Action {
    /// A fresh QUEUED action as the request layer records it
    pub fn queued(id: ActionId, kind: ActionKind, target_server_id: ServerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: ActionStatus::Queued,
            progress: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            target_server_id,
            handle: None,
            dispatch_attempts: 0,
            failure_reason: None,
        }
    }

    /// Derived from status, never stored
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Wire shape returned to API callers
#[derive(Serialize)]
struct ActionView<'a> {
    id: ActionId,
    command: ActionKind,
    status: ActionStatus,
    progress: u8,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    is_finished: bool,
    server_id: ServerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<&'a str>,
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ActionView {
            id: self.id,
            command: self.kind,
            status: self.status,
            progress: self.progress,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            is_finished: self.is_finished(),
            server_id: self.target_server_id,
            failure_reason: self.failure_reason.as_deref(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_finished_follows_status() {
        let mut action = Action::queued(1, ActionKind::CreateServer, 7, Utc::now());
        assert!(!action.is_finished());

        action.status = ActionStatus::Running;
        assert!(!action.is_finished());

        action.status = ActionStatus::Failed;
        assert!(action.is_finished());

        action.status = ActionStatus::Completed;
        assert!(action.is_finished());
    }

    #[test]
    fn test_lifecycle_edges() {
        use ActionStatus::*;

        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
    }

    #[test]
    fn test_action_json_shape() {
        let mut action = Action::queued(3, ActionKind::DeleteServer, 9, Utc::now());
        action.status = ActionStatus::Failed;
        action.failure_reason = Some(FailureReason::Timeout.to_string());

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["command"], "DELETE_SERVER");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["is_finished"], true);
        assert_eq!(json["server_id"], 9);
        assert_eq!(json["failure_reason"], "timeout");
        assert!(json.get("handle").is_none());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("CREATE_SERVER".parse::<ActionKind>(), Ok(ActionKind::CreateServer));
        assert!("REBOOT".parse::<ActionKind>().is_err());
        assert_eq!("running".parse::<ActionStatus>(), Ok(ActionStatus::Running));
        assert!(ActionKind::DeleteServer.mutates_identity());
        assert!(!ActionKind::ModifyServer.mutates_identity());
    }
}
