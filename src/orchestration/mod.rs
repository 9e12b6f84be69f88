//! Orchestration layer: runs plans against registered agents.
//!
//! The [`WorkflowExecutor`] asks a [`SequenceProvider`] which agents to run,
//! invokes them through the [`AgentRegistry`], suspends on human checkpoints
//! and reports progress through an [`EventSink`].

mod builtin;
mod checkpoint;
mod events;
mod executor;
mod registry;
mod sequence;

pub use builtin::{registry_from_config, EchoAgent, PlanningAgent};
pub use checkpoint::CheckpointRegistry;
pub use events::{
    BroadcastSink, EventKind, EventPump, EventSender, EventSink, JsonlSink, MemorySink, PlanEvent,
    StepStream,
};
pub use executor::{CancelOutcome, RecoveredCheckpoint, RecoveryReport, WorkflowExecutor};
pub use registry::{Agent, AgentCall, AgentError, AgentOutput, AgentRegistry};
pub use sequence::{
    validate_proposal, KeywordSequenceProvider, SequenceProposal, SequenceProvider,
    SequenceRequest, StaticSequenceProvider,
};
