//! Multi-agent workflow executor with human checkpoints.
//!
//! A submitted task becomes a [`workflow::Plan`]. The
//! [`orchestration::WorkflowExecutor`] asks a sequence provider which agents
//! to run, waits for the sequence to be approved, runs each agent and
//! optionally waits for a human to approve or revise its result. Plans are
//! persisted after every transition through a [`state::DurableStore`] and can
//! be resumed after a process restart.

pub mod config;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;
pub mod workflow;

pub use config::{Config, ExecutorConfig, ReviewPolicy};
pub use error::{Error, Result};
pub use orchestration::{
    Agent, AgentCall, AgentError, AgentOutput, AgentRegistry, EventKind, EventSink, PlanEvent,
    SequenceProvider, WorkflowExecutor,
};
pub use state::{DurableStore, FileStore, MemoryStore};
pub use workflow::{
    ClarificationResponse, Decision, ExecutionContext, Plan, PlanId, PlanStatus, Snapshot,
    TaskSubmission,
};
