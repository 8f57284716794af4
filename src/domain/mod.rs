//! Domain types for the xcloud worker.
//!
//! This module contains the records the reconciliation engine reads and writes:
//! - Action: a unit of provisioning intent with a lifecycle status
//! - Server: the resource an action mutates on completion

pub mod action;
pub mod server;

// Re-export commonly used types
pub use action::{Action, ActionId, ActionKind, ActionStatus, FailureReason};
pub use server::{ResourceOutcome, Server, ServerId, ServerSpec};
