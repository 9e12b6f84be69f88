//! Core plan and checkpoint type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Return first 8 characters of the UUID for display.
            pub fn short(&self) -> String {
                self.0.to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for one workflow run.
    PlanId
);
uuid_id!(
    /// Groups the plans submitted from one user session.
    SessionId
);
uuid_id!(
    /// Correlates a checkpoint with the human response that closes it.
    RequestId
);

/// Lifecycle status of a plan.
///
/// `Completed`, `Rejected` and `Failed` are terminal; after reaching one of
/// them the plan and its context are never written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created, sequence not yet generated.
    #[default]
    Pending,
    /// Suspended until a human approves or revises the agent sequence.
    AwaitingPlanApproval,
    /// Agents are being invoked.
    Running,
    /// Suspended until a human reviews the latest agent result.
    AwaitingRevision,
    /// Every step was approved.
    Completed,
    /// Aborted by a human or cancelled.
    Rejected,
    /// Terminated by an unrecoverable error.
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Rejected | PlanStatus::Failed
        )
    }

    /// Whether the plan is suspended on a human checkpoint.
    pub fn is_awaiting(self) -> bool {
        matches!(
            self,
            PlanStatus::AwaitingPlanApproval | PlanStatus::AwaitingRevision
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::AwaitingPlanApproval => write!(f, "awaiting_plan_approval"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::AwaitingRevision => write!(f, "awaiting_revision"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Rejected => write!(f, "rejected"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One workflow run. `task_description` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub session_id: SessionId,
    pub task_description: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Human-readable reason recorded when the plan terminates.
    #[serde(default)]
    pub terminal_reason: Option<String>,
}

impl Plan {
    pub fn new(task_description: impl Into<String>, session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            plan_id: PlanId::new(),
            session_id,
            task_description: task_description.into(),
            status: PlanStatus::Pending,
            created_at: now,
            updated_at: now,
            terminal_reason: None,
        }
    }
}

/// One entry of the agent sequence. Ordinal 0 is always the planning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub agent_id: String,
    pub ordinal: usize,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
}

/// Why a step produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Error,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// One finished agent invocation. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub agent_id: String,
    pub ordinal: usize,
    /// Revision cycle that produced this record, starting at 1.
    pub iteration: u32,
    pub result_message: Value,
    /// Present when retries were exhausted; `result_message` then holds the
    /// error payload shown to the reviewer.
    #[serde(default)]
    pub failure: Option<StepFailure>,
    /// Invocations it took, retries included.
    pub attempts: u32,
    /// Position in the context-wide entry order shared with revisions.
    pub entry: u64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Which checkpoint a pending request or revision belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    PlanApproval,
    PostAgentReview,
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointKind::PlanApproval => write!(f, "plan_approval"),
            CheckpointKind::PostAgentReview => write!(f, "post_agent_review"),
        }
    }
}

/// Human feedback recorded as a context entry rather than an overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub kind: CheckpointKind,
    pub request_id: RequestId,
    /// Step being revised; `None` for plan revisions.
    #[serde(default)]
    pub ordinal: Option<usize>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub text: String,
    pub entry: u64,
    pub timestamp: DateTime<Utc>,
}

/// The single open checkpoint of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCheckpoint {
    pub request_id: RequestId,
    pub kind: CheckpointKind,
    /// Index into the context history of the record under review.
    #[serde(default)]
    pub record_index: Option<usize>,
    pub opened_at: DateTime<Utc>,
}

impl PendingCheckpoint {
    pub fn plan_approval() -> Self {
        Self {
            request_id: RequestId::new(),
            kind: CheckpointKind::PlanApproval,
            record_index: None,
            opened_at: Utc::now(),
        }
    }

    pub fn post_agent_review(record_index: usize) -> Self {
        Self {
            request_id: RequestId::new(),
            kind: CheckpointKind::PostAgentReview,
            record_index: Some(record_index),
            opened_at: Utc::now(),
        }
    }
}

/// A checkpoint as presented to a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub request_id: RequestId,
    pub plan_id: PlanId,
    pub kind: CheckpointKind,
    pub presented_payload: Value,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Revise,
    /// Cancels the plan; it terminates as `rejected`.
    Abort,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Revise => write!(f, "revise"),
            Decision::Abort => write!(f, "abort"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" => Ok(Decision::Approve),
            "revise" => Ok(Decision::Revise),
            "abort" => Ok(Decision::Abort),
            other => Err(format!(
                "unknown decision `{other}`, expected approve, revise or abort"
            )),
        }
    }
}

/// A human answer to an open checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    pub request_id: RequestId,
    pub plan_id: PlanId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_text: Option<String>,
}

impl ClarificationResponse {
    pub fn approve(plan_id: PlanId, request_id: RequestId) -> Self {
        Self {
            request_id,
            plan_id,
            decision: Decision::Approve,
            revision_text: None,
        }
    }

    pub fn revise(plan_id: PlanId, request_id: RequestId, text: impl Into<String>) -> Self {
        Self {
            request_id,
            plan_id,
            decision: Decision::Revise,
            revision_text: Some(text.into()),
        }
    }

    pub fn abort(plan_id: PlanId, request_id: RequestId) -> Self {
        Self {
            request_id,
            plan_id,
            decision: Decision::Abort,
            revision_text: None,
        }
    }
}

/// Inbound task submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_description: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl TaskSubmission {
    pub fn new(task_description: impl Into<String>) -> Self {
        Self {
            task_description: task_description.into(),
            session_id: None,
        }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub plan_id: PlanId,
    pub session_id: SessionId,
    pub status: PlanStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Accepted,
    StaleCheckpoint,
}

/// Result of delivering a `ClarificationResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAck {
    pub status: ResponseStatus,
    /// Plan status after the executor ran to its next suspension point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<PlanStatus>,
}

impl ResponseAck {
    pub fn accepted(plan_status: PlanStatus) -> Self {
        Self {
            status: ResponseStatus::Accepted,
            plan_status: Some(plan_status),
        }
    }

    pub fn stale() -> Self {
        Self {
            status: ResponseStatus::StaleCheckpoint,
            plan_status: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ResponseStatus::Accepted
    }
}
