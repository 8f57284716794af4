//! xcloud-worker - Action reconciliation worker
//!
//! Drives server provisioning requests to completion against a slow,
//! unreliable legacy backend. Requests are recorded as actions and return
//! immediately; a control loop then claims, starts and polls them.
//!
//! # Architecture
//!
//! Every state change is a compare-and-swap on the action's status:
//! - QUEUED -> RUNNING is the claim; the backend is only called after it
//! - A failed start rolls the claim back, bounded by a retry budget
//! - RUNNING -> COMPLETED writes the server side effect in the same commit
//! - Actions stuck past the timeout fail, and late backend answers are dropped
//!
//! # Modules
//!
//! - `adapters`: Provisioning backends (simulated, legacy HTTP, scripted)
//! - `core`: Dispatcher, Reconciler, ControlLoop, Clock
//! - `domain`: Data structures (Action, Server)
//! - `store`: Action storage (memory, SQLite)
//! - `requests`: Request-side operations used by the CLI
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a server
//! xcloud-worker server create web-1 --image redhat-9.0
//!
//! # Drive queued actions until Ctrl-C
//! xcloud-worker run
//!
//! # Check an action
//! xcloud-worker action show 1
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod requests;
pub mod store;

// Re-export main types at crate root for convenience
pub use adapters::{Handle, ProgressReport, ProvisioningBackend};
pub use core::{ControlLoop, Dispatcher, EngineError, LoopHandle, LoopState, Reconciler, TickReport};
pub use domain::{Action, ActionKind, ActionStatus, Server};
pub use requests::{RequestError, RequestLayer};
pub use store::{ActionStore, StoreError};
