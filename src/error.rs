use std::time::Duration;

use thiserror::Error;

use crate::workflow::{PlanId, PlanStatus, RequestId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Sequencing failure: {0}")]
    SequencingFailure(String),

    #[error("Agent {agent_id} timed out after {timeout:?}")]
    AgentInvocationTimeout { agent_id: String, timeout: Duration },

    #[error("Agent {agent_id} failed: {message}")]
    AgentInvocationError { agent_id: String, message: String },

    #[error("Stale checkpoint: {request_id}")]
    StaleCheckpoint { request_id: RequestId },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Version conflict on plan {plan_id}: expected {expected}, found {actual}")]
    VersionConflict {
        plan_id: PlanId,
        expected: u64,
        actual: u64,
    },

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: PlanStatus, to: PlanStatus },

    #[error("Plan {0} has already terminated")]
    PlanTerminal(PlanId),

    #[error("Event delivery failed for plan {plan_id}: {message}")]
    EventDelivery { plan_id: PlanId, message: String },
}

impl Error {
    /// Whether a failed store write may succeed if tried again.
    ///
    /// Compare-and-swap conflicts are never retried: another executor owns
    /// the plan and retrying would overwrite its transition.
    pub fn is_retryable_persistence(&self) -> bool {
        matches!(self, Error::PersistenceFailure(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
