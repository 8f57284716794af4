//! Request-side entry points.
//!
//! Creates servers and queues actions against them, and reads records back.
//! Nothing here talks to the backend: the control loop picks up whatever is
//! queued on its next tick.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::config::Catalog;
use crate::core::Clock;
use crate::domain::{Action, ActionId, ActionKind, ActionStatus, Server, ServerId, ServerSpec};
use crate::store::{ActionStore, StoreError};

/// Errors returned to callers of the request layer
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Unknown image: {0}")]
    UnknownImage(String),

    #[error("Unknown server type: {0}")]
    UnknownServerType(String),

    #[error("Unknown datacenter: {0}")]
    UnknownDatacenter(String),

    #[error("Server {0} not found")]
    ServerNotFound(ServerId),

    #[error("Server {0} is already deprovisioned")]
    AlreadyDeprovisioned(ServerId),

    #[error("Action {0} not found")]
    ActionNotFound(ActionId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RequestLayer {
    store: Arc<dyn ActionStore>,
    clock: Arc<dyn Clock>,
    catalog: Catalog,
}

impl RequestLayer {
    pub fn new(store: Arc<dyn ActionStore>, clock: Arc<dyn Clock>, catalog: Catalog) -> Self {
        Self {
            store,
            clock,
            catalog,
        }
    }

    /// Record a new server and queue its CREATE_SERVER action
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_server(&self, spec: ServerSpec) -> Result<(Server, Action), RequestError> {
        self.validate(&spec)?;

        let now = self.clock.now();
        let server = self.store.create_server(spec, now).await?;
        let action = self
            .store
            .enqueue(server.id, ActionKind::CreateServer, now)
            .await?;

        info!(server_id = server.id, action_id = action.id, "Queued server creation");
        Ok((server, action))
    }

    /// Queue DELETE_SERVER. The server is flagged deprovisioned only once the
    /// action completes.
    #[instrument(skip(self))]
    pub async fn delete_server(&self, server_id: ServerId) -> Result<Action, RequestError> {
        let server = self.require_server(server_id).await?;
        if server.is_deprovisioned {
            return Err(RequestError::AlreadyDeprovisioned(server_id));
        }

        let action = self
            .store
            .enqueue(server_id, ActionKind::DeleteServer, self.clock.now())
            .await?;

        info!(server_id, action_id = action.id, "Queued server deletion");
        Ok(action)
    }

    #[instrument(skip(self))]
    pub async fn modify_server(&self, server_id: ServerId) -> Result<Action, RequestError> {
        let server = self.require_server(server_id).await?;
        if server.is_deprovisioned {
            return Err(RequestError::AlreadyDeprovisioned(server_id));
        }

        let action = self
            .store
            .enqueue(server_id, ActionKind::ModifyServer, self.clock.now())
            .await?;

        info!(server_id, action_id = action.id, "Queued server modification");
        Ok(action)
    }

    pub async fn get_action(&self, id: ActionId) -> Result<Action, RequestError> {
        self.store
            .get_action(id)
            .await?
            .ok_or(RequestError::ActionNotFound(id))
    }

    pub async fn get_server(&self, id: ServerId) -> Result<Server, RequestError> {
        self.require_server(id).await
    }

    pub async fn list_actions(
        &self,
        status: Option<ActionStatus>,
        limit: usize,
    ) -> Result<Vec<Action>, RequestError> {
        Ok(self.store.list_actions(status, limit).await?)
    }

    async fn require_server(&self, id: ServerId) -> Result<Server, RequestError> {
        self.store
            .get_server(id)
            .await?
            .ok_or(RequestError::ServerNotFound(id))
    }

    fn validate(&self, spec: &ServerSpec) -> Result<(), RequestError> {
        if !self.catalog.images.contains(&spec.image) {
            return Err(RequestError::UnknownImage(spec.image.clone()));
        }
        if !self.catalog.server_types.contains(&spec.server_type) {
            return Err(RequestError::UnknownServerType(spec.server_type.clone()));
        }
        if !self.catalog.datacenters.contains(&spec.datacenter) {
            return Err(RequestError::UnknownDatacenter(spec.datacenter.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::store::MemoryActionStore;

    fn layer() -> (Arc<MemoryActionStore>, RequestLayer) {
        let store = Arc::new(MemoryActionStore::new());
        let layer = RequestLayer::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            Catalog::default(),
        );
        (store, layer)
    }

    fn spec(image: &str) -> ServerSpec {
        ServerSpec {
            name: "web-1".to_string(),
            image: image.to_string(),
            server_type: "linux-small".to_string(),
            datacenter: "fra1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_queues_action() {
        let (_store, layer) = layer();

        let (server, action) = layer.create_server(spec("redhat-9.0")).await.unwrap();
        assert_eq!(action.kind, ActionKind::CreateServer);
        assert_eq!(action.status, ActionStatus::Queued);
        assert_eq!(action.target_server_id, server.id);
        assert!(server.ipv4_address.is_none());
        assert!(!action.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_image_rejected() {
        let (store, layer) = layer();

        let result = layer.create_server(spec("windows-95")).await;
        assert!(matches!(result, Err(RequestError::UnknownImage(_))));
        assert!(store.list_actions(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_leaves_server_until_completion() {
        let (_store, layer) = layer();
        let (server, _) = layer.create_server(spec("redhat-8.6")).await.unwrap();

        let action = layer.delete_server(server.id).await.unwrap();
        assert_eq!(action.kind, ActionKind::DeleteServer);

        let server = layer.get_server(server.id).await.unwrap();
        assert!(!server.is_deprovisioned);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let (_store, layer) = layer();

        assert!(matches!(
            layer.delete_server(99).await,
            Err(RequestError::ServerNotFound(99))
        ));
        assert!(matches!(
            layer.get_action(5).await,
            Err(RequestError::ActionNotFound(5))
        ));
    }
}
