//! Sequence providers decide which agents run for a task.
//!
//! Whatever backs a provider, its proposal must pass [`validate_proposal`]:
//! non-empty, led by the planning agent, every id registered.

use std::collections::HashSet;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{Config, RouteRule};
use crate::error::{Error, Result};
use crate::workflow::AgentStep;

use super::registry::AgentRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRequest {
    pub task_description: String,
    /// Plan revisions the human asked for so far, oldest first.
    pub revisions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceProposal {
    pub agent_ids: Vec<String>,
    /// Cost hints aligned with `agent_ids`; missing entries mean no hint.
    pub estimated_costs: Vec<Option<f64>>,
    pub metadata: Map<String, Value>,
}

impl SequenceProposal {
    pub fn new<I, S>(agent_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_ids: agent_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait SequenceProvider: Send + Sync {
    async fn generate(&self, request: &SequenceRequest) -> Result<SequenceProposal>;
}

/// Turn a proposal into numbered steps, rejecting any shape the executor
/// cannot run.
pub fn validate_proposal(
    proposal: &SequenceProposal,
    planning_agent: &str,
    agents: &AgentRegistry,
) -> Result<Vec<AgentStep>> {
    let Some(first) = proposal.agent_ids.first() else {
        return Err(Error::SequencingFailure("sequence is empty".to_string()));
    };
    if first != planning_agent {
        return Err(Error::SequencingFailure(format!(
            "sequence must start with `{planning_agent}`, got `{first}`"
        )));
    }
    if let Some(unknown) = proposal.agent_ids.iter().find(|id| !agents.contains(id)) {
        return Err(Error::SequencingFailure(format!(
            "sequence names unregistered agent `{unknown}`"
        )));
    }
    Ok(proposal
        .agent_ids
        .iter()
        .enumerate()
        .map(|(ordinal, agent_id)| AgentStep {
            agent_id: agent_id.clone(),
            ordinal,
            estimated_cost: proposal.estimated_costs.get(ordinal).copied().flatten(),
        })
        .collect())
}

/// Always proposes the same agents.
pub struct StaticSequenceProvider {
    agent_ids: Vec<String>,
}

impl StaticSequenceProvider {
    pub fn new<I, S>(agent_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_ids: agent_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SequenceProvider for StaticSequenceProvider {
    async fn generate(&self, _request: &SequenceRequest) -> Result<SequenceProposal> {
        Ok(SequenceProposal::new(self.agent_ids.clone()).with_metadata("provider", "static"))
    }
}

struct CompiledRoute {
    pattern: Regex,
    agents: Vec<String>,
}

/// Routes on whole-word keyword matches in the task and its plan revisions.
///
/// The planning agent always leads; routed agents follow in rule order
/// without duplicates. When no rule matches, the fallback agents run.
pub struct KeywordSequenceProvider {
    planning_agent: String,
    routes: Vec<CompiledRoute>,
    fallback: Vec<String>,
}

impl KeywordSequenceProvider {
    pub fn new(planning_agent: impl Into<String>, routes: &[RouteRule], fallback: Vec<String>) -> Result<Self> {
        let routes = routes
            .iter()
            .filter(|rule| !rule.keywords.is_empty())
            .map(|rule| {
                let alternatives: Vec<String> = rule.keywords.iter().map(|k| regex::escape(k)).collect();
                let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
                    .map_err(|e| Error::Validation(format!("bad route keywords {:?}: {e}", rule.keywords)))?;
                Ok(CompiledRoute {
                    pattern,
                    agents: rule.agents.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            planning_agent: planning_agent.into(),
            routes,
            fallback,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.executor.planning_agent.clone(),
            &config.routes,
            config.fallback.clone(),
        )
    }
}

#[async_trait]
impl SequenceProvider for KeywordSequenceProvider {
    async fn generate(&self, request: &SequenceRequest) -> Result<SequenceProposal> {
        let mut text = request.task_description.clone();
        for revision in &request.revisions {
            text.push('\n');
            text.push_str(revision);
        }

        let mut seen = HashSet::new();
        let mut routed = Vec::new();
        for route in self.routes.iter().filter(|r| r.pattern.is_match(&text)) {
            for agent in &route.agents {
                if agent != &self.planning_agent && seen.insert(agent.clone()) {
                    routed.push(agent.clone());
                }
            }
        }
        let matched = !routed.is_empty();
        if !matched {
            routed = self
                .fallback
                .iter()
                .filter(|a| *a != &self.planning_agent)
                .cloned()
                .collect();
        }

        let mut agent_ids = Vec::with_capacity(routed.len() + 1);
        agent_ids.push(self.planning_agent.clone());
        agent_ids.extend(routed);
        tracing::debug!(sequence = ?agent_ids, matched, "keyword routing");

        Ok(SequenceProposal::new(agent_ids)
            .with_metadata("provider", "keyword")
            .with_metadata("matched_route", matched)
            .with_metadata("revisions", request.revisions.len()))
    }
}
