//! In-process stand-in for the legacy backend.
//!
//! A job finishes a fixed duration after its action was claimed, measured on
//! the injected clock, and reports linear progress until then. The job lives
//! entirely in its handle, so a backend built by a later process can poll a
//! handle persisted by an earlier one. CREATE_SERVER jobs get one address per
//! server from `10.10.10.0/24`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use super::{Handle, ProgressReport, ProvisioningBackend};
use crate::core::Clock;
use crate::domain::{Action, ActionId, ActionKind, ResourceOutcome, ServerId};

const HANDLE_PREFIX: &str = "sim";
const FIRST_HOST: i64 = 10;
const LAST_HOST: i64 = 254;

/// Simulated job, as encoded in its handle
#[derive(Debug, Clone, PartialEq, Eq)]
struct Job {
    action_id: ActionId,
    kind: ActionKind,
    server_id: ServerId,
    started_at: DateTime<Utc>,
}

impl Job {
    /// The job of a claimed action starts at the claim
    fn for_action(action: &Action, now: DateTime<Utc>) -> Self {
        Self {
            action_id: action.id,
            kind: action.kind,
            server_id: action.target_server_id,
            started_at: action.started_at.unwrap_or(now),
        }
    }

    fn handle(&self) -> Handle {
        Handle::new(format!(
            "{}:{}:{}:{}:{}",
            HANDLE_PREFIX,
            self.action_id,
            self.kind.as_str(),
            self.server_id,
            self.started_at.timestamp_millis()
        ))
    }

    fn parse(handle: &Handle) -> Result<Self> {
        let parts: Vec<&str> = handle.as_str().split(':').collect();
        let [HANDLE_PREFIX, action_id, kind, server_id, started_ms] = parts[..] else {
            bail!("unknown simulated job: {}", handle);
        };

        let started_ms: i64 = started_ms
            .parse()
            .with_context(|| format!("bad start time in handle {}", handle))?;

        Ok(Self {
            action_id: action_id
                .parse()
                .with_context(|| format!("bad action id in handle {}", handle))?,
            kind: kind.parse().map_err(|e: String| anyhow!(e))?,
            server_id: server_id
                .parse()
                .with_context(|| format!("bad server id in handle {}", handle))?,
            started_at: Utc
                .timestamp_millis_opt(started_ms)
                .single()
                .ok_or_else(|| anyhow!("start time out of range in handle {}", handle))?,
        })
    }

    fn address(&self) -> Option<String> {
        let host = FIRST_HOST.checked_add(self.server_id.checked_sub(1)?)?;
        (FIRST_HOST..=LAST_HOST)
            .contains(&host)
            .then(|| format!("10.10.10.{}", host))
    }
}

/// Simulated provisioning backend
pub struct SimulatedBackend {
    clock: Arc<dyn Clock>,
    duration: Duration,
}

impl SimulatedBackend {
    pub fn new(clock: Arc<dyn Clock>, duration: Duration) -> Self {
        Self { clock, duration }
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn start_provisioning(&self, action: &Action) -> Result<Handle> {
        let handle = Job::for_action(action, self.clock.now()).handle();
        tracing::info!(action_id = action.id, kind = %action.kind, %handle, "Simulated job started");
        Ok(handle)
    }

    async fn poll_status(&self, handle: &Handle) -> Result<ProgressReport> {
        let job = Job::parse(handle)?;

        let elapsed = self.clock.now() - job.started_at;
        if elapsed < self.duration {
            let total = self.duration.num_milliseconds().max(1);
            let percent = (elapsed.num_milliseconds().max(0) * 100 / total).min(99);
            return Ok(ProgressReport::InProgress(percent as u8));
        }

        match job.kind {
            ActionKind::CreateServer => match job.address() {
                Some(address) => Ok(ProgressReport::Done(ResourceOutcome::with_ipv4(address))),
                None => Ok(ProgressReport::Failed("address pool exhausted".to_string())),
            },
            ActionKind::DeleteServer | ActionKind::ModifyServer => {
                Ok(ProgressReport::Done(ResourceOutcome::default()))
            }
        }
    }

    async fn find_handle(&self, action: &Action) -> Result<Option<Handle>> {
        // Only claimed actions have a job
        Ok(action
            .started_at
            .map(|_| Job::for_action(action, self.clock.now()).handle()))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
