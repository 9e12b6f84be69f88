//! Plan, execution-context and checkpoint types.
//!
//! This module holds the data model the executor threads through a run
//! together with the status state machine that validates every transition.

mod context;
mod state;
mod types;

pub use context::{ExecutionContext, Snapshot, TranscriptEntry};
pub use state::{transition, ExecutorState};
pub use types::{
    AgentStep, CheckpointKind, ClarificationRequest, ClarificationResponse, Decision,
    ExecutionRecord, FailureKind, PendingCheckpoint, Plan, PlanId, PlanStatus, RequestId,
    ResponseAck, ResponseStatus, RevisionEntry, SessionId, StepFailure, SubmissionReceipt,
    TaskSubmission,
};
