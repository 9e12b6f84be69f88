//! Agent contract and lookup table.
//!
//! Agents are resolved by id through [`AgentRegistry`]; the executor never
//! branches on agent names. The registry is built once at startup and shared
//! read-only between every running plan.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::workflow::{AgentStep, ExecutionContext, ExecutionRecord};

use super::events::StepStream;

/// Everything an agent sees for one invocation.
pub struct AgentCall<'a> {
    /// Full plan context, history and revision notes included.
    pub context: &'a ExecutionContext,
    pub step: &'a AgentStep,
    /// Revision cycle this invocation belongs to, starting at 1.
    pub iteration: u32,
    /// Automatic retry attempt within the iteration, starting at 1.
    pub attempt: u32,
    pub stream: &'a StepStream,
}

impl AgentCall<'_> {
    /// The human's latest note for this step, if it is being revised.
    pub fn feedback(&self) -> Option<&str> {
        self.context.latest_feedback(self.step.ordinal)
    }

    /// Results earlier iterations of this step produced.
    pub fn previous_results(&self) -> Vec<&ExecutionRecord> {
        self.context.records_for(self.step.ordinal).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub message: Value,
    /// Ask for a human review even when the review policy would skip it.
    pub needs_revision: bool,
}

impl AgentOutput {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            needs_revision: false,
        }
    }

    pub fn needing_revision(mut self) -> Self {
        self.needs_revision = true;
        self
    }
}

/// Explicit failure reported by an agent.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<Error> for AgentError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, call: AgentCall<'_>) -> std::result::Result<AgentOutput, AgentError>;
}

#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under `id`. Ids are unique.
    pub fn register(&mut self, id: impl Into<String>, agent: impl Agent + 'static) -> Result<()> {
        self.register_arc(id, Arc::new(agent))
    }

    pub fn register_arc(&mut self, id: impl Into<String>, agent: Arc<dyn Agent>) -> Result<()> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("agent id must be non-empty".to_string()));
        }
        if self.agents.contains_key(&id) {
            return Err(Error::Validation(format!("agent `{id}` is already registered")));
        }
        tracing::debug!(agent_id = %id, "agent registered");
        self.agents.insert(id, agent);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn Agent>> {
        self.get(id).ok_or_else(|| Error::UnknownAgent(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
