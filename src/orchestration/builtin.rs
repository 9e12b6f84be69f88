//! Built-in agents registered by the CLI.
//!
//! Neither does real work. `PlanningAgent` summarises the approved sequence
//! and `EchoAgent` reports what it was asked, which is enough to walk a plan
//! through every checkpoint from the command line.

use async_trait::async_trait;
use serde_json::json;

use crate::config::{AgentKind, Config};
use crate::error::Result;

use super::registry::{Agent, AgentCall, AgentError, AgentOutput, AgentRegistry};

pub struct PlanningAgent;

#[async_trait]
impl Agent for PlanningAgent {
    async fn invoke(&self, call: AgentCall<'_>) -> std::result::Result<AgentOutput, AgentError> {
        let context = call.context;
        let remaining: Vec<String> = context
            .sequence
            .iter()
            .skip(call.step.ordinal + 1)
            .map(|s| s.agent_id.clone())
            .collect();
        call.stream
            .send(format!("planning {} step(s)", remaining.len()))
            .await?;
        Ok(AgentOutput::new(json!({
            "task": context.task_description,
            "steps": remaining,
            "plan_revisions": context.plan_revisions(),
            "feedback": call.feedback(),
        })))
    }
}

pub struct EchoAgent {
    id: String,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn invoke(&self, call: AgentCall<'_>) -> std::result::Result<AgentOutput, AgentError> {
        let feedback = call.feedback();
        let summary = match feedback {
            Some(note) => format!(
                "{} handled \"{}\" (revision: {})",
                self.id, call.context.task_description, note
            ),
            None => format!("{} handled \"{}\"", self.id, call.context.task_description),
        };
        call.stream.send(summary.clone()).await?;
        Ok(AgentOutput::new(json!({
            "agent": self.id,
            "summary": summary,
            "iteration": call.iteration,
            "previous_results": call.previous_results().len(),
        })))
    }
}

/// Registry holding the agents listed in the config.
pub fn registry_from_config(config: &Config) -> Result<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for spec in &config.agents {
        match spec.kind {
            AgentKind::Planning => registry.register(spec.id.clone(), PlanningAgent)?,
            AgentKind::Echo => registry.register(spec.id.clone(), EchoAgent::new(spec.id.clone()))?,
        }
    }
    Ok(registry)
}
