//! Servers, the resources actions provision.
//!
//! The engine only ever writes two fields here: `ipv4_address` when a
//! CREATE_SERVER completes and `is_deprovisioned` when a DELETE_SERVER does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ServerId = i64;

/// A provisioned (or to-be-provisioned) virtual server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub image: String,
    pub server_type: String,
    pub datacenter: String,

    /// Assigned by the backend on CREATE_SERVER completion
    pub ipv4_address: Option<String>,

    /// Set on DELETE_SERVER completion
    pub is_deprovisioned: bool,

    pub created_at: DateTime<Utc>,
}

/// What the request layer asks for when creating a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub image: String,
    pub server_type: String,
    pub datacenter: String,
}

impl Server {
    pub fn from_spec(id: ServerId, spec: ServerSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: spec.name,
            image: spec.image,
            server_type: spec.server_type,
            datacenter: spec.datacenter,
            ipv4_address: None,
            is_deprovisioned: false,
            created_at: now,
        }
    }
}

/// Resource data reported by the backend alongside a successful result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

impl ResourceOutcome {
    pub fn with_ipv4(address: impl Into<String>) -> Self {
        Self {
            ipv4_address: Some(address.into()),
        }
    }
}
