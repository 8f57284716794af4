//! Deterministic backend for tests.
//!
//! Each action gets a [`Script`]: how many starts fail before one succeeds and
//! the sequence of poll results. The last poll entry repeats once the sequence
//! runs out. Calls are counted so tests can assert exactly-once dispatch.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{Handle, ProgressReport, ProvisioningBackend};
use crate::domain::{Action, ActionId, ResourceOutcome};

/// One scripted poll result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedPoll {
    Report(ProgressReport),

    /// Poll call fails (transient)
    Error(String),
}

/// Scripted behavior for one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Starts that fail before the first success (`u32::MAX` for never)
    pub start_failures: u32,
    pub polls: Vec<ScriptedPoll>,
}

impl Script {
    /// `InProgress` for `polls - 1` polls, then `Done(outcome)`
    pub fn done_after(polls: usize, outcome: ResourceOutcome) -> Self {
        let polls = polls.max(1);
        let mut steps: Vec<ScriptedPoll> = (1..polls)
            .map(|i| ScriptedPoll::Report(ProgressReport::InProgress((i * 100 / polls) as u8)))
            .collect();
        steps.push(ScriptedPoll::Report(ProgressReport::Done(outcome)));
        Self {
            start_failures: 0,
            polls: steps,
        }
    }

    /// Fails on the first poll with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            start_failures: 0,
            polls: vec![ScriptedPoll::Report(ProgressReport::Failed(reason.into()))],
        }
    }

    /// Every poll errors
    pub fn unresponsive() -> Self {
        Self {
            start_failures: 0,
            polls: vec![ScriptedPoll::Error("backend not responding".to_string())],
        }
    }

    /// Explicit poll sequence
    pub fn polls(polls: Vec<ScriptedPoll>) -> Self {
        Self {
            start_failures: 0,
            polls,
        }
    }

    pub fn with_start_failures(mut self, failures: u32) -> Self {
        self.start_failures = failures;
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::done_after(1, ResourceOutcome::default())
    }
}

#[derive(Debug, Default)]
struct State {
    default_script: Script,
    scripts: HashMap<ActionId, Script>,
    handles: HashMap<Handle, ActionId>,
    start_calls: HashMap<ActionId, u32>,
    successful_starts: HashMap<ActionId, u32>,
    poll_calls: HashMap<ActionId, usize>,
}

/// Backend driven entirely by scripts
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<State>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script used for actions without their own script
    pub fn with_default(script: Script) -> Self {
        let backend = Self::default();
        backend.lock().default_script = script;
        backend
    }

    pub fn script(&self, action_id: ActionId, script: Script) {
        self.lock().scripts.insert(action_id, script);
    }

    /// All start calls for an action, failed ones included
    pub fn start_calls(&self, action_id: ActionId) -> u32 {
        self.lock().start_calls.get(&action_id).copied().unwrap_or(0)
    }

    /// Start calls that returned a handle
    pub fn successful_starts(&self, action_id: ActionId) -> u32 {
        self.lock()
            .successful_starts
            .get(&action_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn poll_calls(&self, action_id: ActionId) -> usize {
        self.lock().poll_calls.get(&action_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_for(action_id: ActionId) -> Handle {
        Handle::new(format!("scripted-{}", action_id))
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start_provisioning(&self, action: &Action) -> Result<Handle> {
        let mut state = self.lock();
        let calls = state.start_calls.entry(action.id).or_insert(0);
        *calls += 1;
        let calls = *calls;

        let failures = state
            .scripts
            .get(&action.id)
            .unwrap_or(&state.default_script)
            .start_failures;
        if calls <= failures {
            return Err(anyhow!("scripted start failure {} for action {}", calls, action.id));
        }

        *state.successful_starts.entry(action.id).or_insert(0) += 1;
        let handle = Self::handle_for(action.id);
        state.handles.insert(handle.clone(), action.id);
        Ok(handle)
    }

    async fn poll_status(&self, handle: &Handle) -> Result<ProgressReport> {
        let mut state = self.lock();
        let action_id = *state
            .handles
            .get(handle)
            .ok_or_else(|| anyhow!("unknown scripted handle: {}", handle))?;

        let index = {
            let calls = state.poll_calls.entry(action_id).or_insert(0);
            *calls += 1;
            *calls - 1
        };

        let script = state.scripts.get(&action_id).unwrap_or(&state.default_script);
        let step = script
            .polls
            .get(index)
            .or_else(|| script.polls.last())
            .cloned()
            .unwrap_or(ScriptedPoll::Report(ProgressReport::InProgress(0)));

        match step {
            ScriptedPoll::Report(report) => Ok(report),
            ScriptedPoll::Error(message) => Err(anyhow!(message)),
        }
    }

    async fn find_handle(&self, action: &Action) -> Result<Option<Handle>> {
        let state = self.lock();
        Ok(state
            .handles
            .iter()
            .find(|(_, id)| **id == action.id)
            .map(|(handle, _)| handle.clone()))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
