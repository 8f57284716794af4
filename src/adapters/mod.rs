//! Adapter interfaces for the provisioning backend.
//!
//! The engine never talks to the legacy system directly. It starts work and
//! polls for progress through [`ProvisioningBackend`]; production and test
//! backends implement the same trait.

pub mod legacy_http;
pub mod scripted;
pub mod simulated;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{Action, ResourceOutcome};

pub use legacy_http::{LegacyHttpBackend, LegacyHttpConfig};
pub use scripted::{Script, ScriptedBackend, ScriptedPoll};
pub use simulated::SimulatedBackend;

/// Opaque reference to a job on the backend side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of polling a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressReport {
    /// Still working; percent is a hint in 0..=100
    InProgress(u8),

    /// Finished successfully
    Done(ResourceOutcome),

    /// Finished unsuccessfully
    Failed(String),
}

impl ProgressReport {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressReport::InProgress(_))
    }
}

/// Trait for provisioning backends
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Kick off backend work for a claimed action.
    ///
    /// Must be idempotent per [`dispatch_key`]: a repeated start for the same
    /// key returns the existing job's handle.
    async fn start_provisioning(&self, action: &Action) -> Result<Handle>;

    /// Report progress of a previously started job
    async fn poll_status(&self, handle: &Handle) -> Result<ProgressReport>;

    /// Look up the job for an action whose handle was never recorded locally
    async fn find_handle(&self, action: &Action) -> Result<Option<Handle>>;

    /// Health check
    async fn health_check(&self) -> Result<()>;
}

/// Idempotency key sent with every start of an action.
///
/// Retries and crash recovery reuse the key, so the backend holds at most one
/// job per action. Format: first 16 hex chars of SHA256("{id}:{kind}").
pub fn dispatch_key(action: &Action) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", action.id, action.kind).as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionKind;
    use chrono::Utc;

    #[test]
    fn test_dispatch_key_stable_across_retries() {
        let now = Utc::now();
        let action = Action::queued(42, ActionKind::CreateServer, 1, now);

        let mut retried = action.clone();
        retried.dispatch_attempts = 2;
        assert_eq!(dispatch_key(&action), dispatch_key(&retried));
        assert_eq!(dispatch_key(&action).len(), 16);

        let delete = Action::queued(42, ActionKind::DeleteServer, 1, now);
        assert_ne!(dispatch_key(&action), dispatch_key(&delete));

        let other = Action::queued(43, ActionKind::CreateServer, 1, now);
        assert_ne!(dispatch_key(&action), dispatch_key(&other));
    }

    #[test]
    fn test_progress_report_terminal() {
        assert!(!ProgressReport::InProgress(50).is_terminal());
        assert!(ProgressReport::Done(ResourceOutcome::default()).is_terminal());
        assert!(ProgressReport::Failed("quota".into()).is_terminal());
    }
}
