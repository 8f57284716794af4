//! In-memory action store.
//!
//! All records live behind one mutex; each trait method is a single critical
//! section, which is what makes `claim` and `commit_transition` atomic here.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ActionStore, StoreError, Transition};
use crate::domain::{Action, ActionId, ActionKind, ActionStatus, Server, ServerId, ServerSpec};

#[derive(Debug, Default)]
struct Inner {
    actions: BTreeMap<ActionId, Action>,
    servers: BTreeMap<ServerId, Server>,
    next_action_id: ActionId,
    next_server_id: ServerId,
    offline: bool,
}

impl Inner {
    fn identity_busy(&self, action: &Action) -> bool {
        action.kind.mutates_identity()
            && self.actions.values().any(|other| {
                other.id != action.id
                    && other.target_server_id == action.target_server_id
                    && other.status == ActionStatus::Running
                    && other.kind.mutates_identity()
            })
    }
}

/// Action store held in process memory
#[derive(Debug, Default)]
pub struct MemoryActionStore {
    inner: Mutex<Inner>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going away (every call fails with `Unavailable`)
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).offline = offline;
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let guard = self
            .inner
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("memory store lock poisoned: {}", e)))?;
        if guard.offline {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(guard)
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn select_queued(&self, limit: usize) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock()?;
        let mut queued: Vec<Action> = inner
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Queued && !inner.identity_busy(a))
            .cloned()
            .collect();
        queued.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        queued.truncate(limit);
        Ok(queued)
    }

    async fn claim(&self, id: ActionId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(action) = inner.actions.get(&id) else {
            return Err(StoreError::NotFound { entity: "action", id });
        };
        if action.status != ActionStatus::Queued || inner.identity_busy(action) {
            return Ok(false);
        }

        if let Some(action) = inner.actions.get_mut(&id) {
            action.status = ActionStatus::Running;
            action.started_at = Some(now);
        }
        Ok(true)
    }

    async fn select_running(&self, limit: usize) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock()?;
        let mut running: Vec<Action> = inner
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| (a.started_at, a.id).cmp(&(b.started_at, b.id)));
        running.truncate(limit);
        Ok(running)
    }

    async fn commit_transition(
        &self,
        id: ActionId,
        expected: ActionStatus,
        transition: Transition,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(current) = inner.actions.get(&id) else {
            return Err(StoreError::NotFound { entity: "action", id });
        };
        if current.status != expected {
            return Ok(false);
        }

        // Work on copies so a failure leaves both records untouched
        let mut action = current.clone();
        transition.apply(&mut action)?;

        let server = match transition.server_patch() {
            Some(patch) => {
                let mut server = inner
                    .servers
                    .get(&action.target_server_id)
                    .cloned()
                    .ok_or(StoreError::NotFound {
                        entity: "server",
                        id: action.target_server_id,
                    })?;
                patch.apply(&mut server);
                Some(server)
            }
            None => None,
        };

        if let Some(server) = server {
            inner.servers.insert(server.id, server);
        }
        inner.actions.insert(id, action);
        Ok(true)
    }

    async fn create_server(
        &self,
        spec: ServerSpec,
        now: DateTime<Utc>,
    ) -> Result<Server, StoreError> {
        let mut inner = self.lock()?;
        inner.next_server_id += 1;
        let server = Server::from_spec(inner.next_server_id, spec, now);
        inner.servers.insert(server.id, server.clone());
        Ok(server)
    }

    async fn enqueue(
        &self,
        server_id: ServerId,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Action, StoreError> {
        let mut inner = self.lock()?;
        if !inner.servers.contains_key(&server_id) {
            return Err(StoreError::NotFound {
                entity: "server",
                id: server_id,
            });
        }
        inner.next_action_id += 1;
        let action = Action::queued(inner.next_action_id, kind, server_id, now);
        inner.actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn get_action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        Ok(self.lock()?.actions.get(&id).cloned())
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, StoreError> {
        Ok(self.lock()?.servers.get(&id).cloned())
    }

    async fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .actions
            .values()
            .rev()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}
