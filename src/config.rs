use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Which agents get a post-agent review checkpoint.
///
/// Step failures and outputs flagged `needs_revision` are reviewed whatever
/// the policy says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReviewPolicy {
    All,
    None,
    Only { agents: Vec<String> },
    Except { agents: Vec<String> },
}

impl ReviewPolicy {
    /// Review every step except the planning agent's.
    pub fn except_planning(planning_agent: &str) -> Self {
        ReviewPolicy::Except {
            agents: vec![planning_agent.to_string()],
        }
    }

    pub fn requires_review(&self, agent_id: &str) -> bool {
        match self {
            ReviewPolicy::All => true,
            ReviewPolicy::None => false,
            ReviewPolicy::Only { agents } => agents.iter().any(|a| a == agent_id),
            ReviewPolicy::Except { agents } => !agents.iter().any(|a| a == agent_id),
        }
    }
}

pub const DEFAULT_PLANNING_AGENT: &str = "planning";

/// `[executor]` table of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub planning_agent: String,
    pub agent_timeout_secs: u64,
    /// Per-agent overrides of `agent_timeout_secs`.
    pub agent_timeouts: HashMap<String, u64>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub persist_retries: u32,
    pub event_buffer: usize,
    /// Unset means every agent but `planning_agent` is reviewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewPolicy>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            planning_agent: DEFAULT_PLANNING_AGENT.to_string(),
            agent_timeout_secs: 300,
            agent_timeouts: HashMap::new(),
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 10_000,
            persist_retries: 3,
            event_buffer: 64,
            review: None,
        }
    }
}

/// Keyword routing rule for the built-in sequence provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub keywords: Vec<String>,
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planning,
    Echo,
}

/// An agent the CLI registers at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub kind: AgentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overrides `~/.agentflow` as the root for plans, events and logs.
    pub state_dir: Option<String>,
    pub executor: ExecutorSettings,
    pub routes: Vec<RouteRule>,
    /// Agents run after planning when no route matches.
    pub fallback: Vec<String>,
    pub agents: Vec<AgentSpec>,
}

impl Default for Config {
    fn default() -> Self {
        let echo = |id: &str| AgentSpec {
            id: id.to_string(),
            kind: AgentKind::Echo,
        };
        Self {
            state_dir: None,
            executor: ExecutorSettings::default(),
            routes: vec![
                RouteRule {
                    keywords: vec!["invoice".to_string(), "bill".to_string()],
                    agents: vec!["invoice".to_string()],
                },
                RouteRule {
                    keywords: vec!["crm".to_string(), "customer".to_string()],
                    agents: vec!["crm".to_string()],
                },
            ],
            fallback: vec!["general".to_string()],
            agents: vec![
                AgentSpec {
                    id: DEFAULT_PLANNING_AGENT.to_string(),
                    kind: AgentKind::Planning,
                },
                echo("invoice"),
                echo("crm"),
                echo("general"),
            ],
        }
    }
}

impl Config {
    pub fn agentflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::agentflow_dir()?.join("agentflow.toml"))
    }

    pub fn state_root(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::agentflow_dir(),
        }
    }

    pub fn plans_dir(&self) -> Result<PathBuf> {
        Ok(self.state_root()?.join("plans"))
    }

    pub fn events_dir(&self) -> Result<PathBuf> {
        Ok(self.state_root()?.join("events"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            planning_agent = %config.executor.planning_agent,
            routes = config.routes.len(),
            agents = config.agents.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.planning_agent.trim().is_empty() {
            return Err(Error::Validation(
                "executor.planning_agent must be non-empty".to_string(),
            ));
        }
        if self.executor.event_buffer == 0 {
            return Err(Error::Validation(
                "executor.event_buffer must be at least 1".to_string(),
            ));
        }
        if let Some(route) = self.routes.iter().find(|r| r.agents.is_empty()) {
            return Err(Error::Validation(format!(
                "route for keywords {:?} names no agents",
                route.keywords
            )));
        }
        Ok(())
    }
}

/// Runtime form of [`ExecutorSettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub planning_agent: String,
    pub default_timeout: Duration,
    pub agent_timeouts: HashMap<String, Duration>,
    /// Automatic retries after the first failed invocation of a step.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub persist_retries: u32,
    pub event_buffer: usize,
    pub review: ReviewPolicy,
}

impl ExecutorConfig {
    pub fn timeout_for(&self, agent_id: &str) -> Duration {
        self.agent_timeouts
            .get(agent_id)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Settings with millisecond timings, for tests and demos.
    pub fn fast() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            planning_agent: settings.planning_agent.clone(),
            default_timeout: Duration::from_secs(settings.agent_timeout_secs),
            agent_timeouts: settings
                .agent_timeouts
                .iter()
                .map(|(id, secs)| (id.clone(), Duration::from_secs(*secs)))
                .collect(),
            max_retries: settings.max_retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            persist_retries: settings.persist_retries,
            event_buffer: settings.event_buffer.max(1),
            review: settings
                .review
                .clone()
                .unwrap_or_else(|| ReviewPolicy::except_planning(&settings.planning_agent)),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
