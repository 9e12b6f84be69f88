//! Execution context threaded through one plan's run.
//!
//! `ExecutionContext` is the only mutable state of a plan. The executor owns
//! it for the duration of one transition and writes it to the durable store
//! as part of a [`Snapshot`] before announcing the transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::types::{
    AgentStep, CheckpointKind, ExecutionRecord, PendingCheckpoint, Plan, PlanId, PlanStatus,
    RequestId, RevisionEntry, StepFailure,
};

/// One item of the chronological view returned by
/// [`ExecutionContext::transcript`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TranscriptEntry<'a> {
    Record(&'a ExecutionRecord),
    Revision(&'a RevisionEntry),
}

impl TranscriptEntry<'_> {
    fn entry(&self) -> u64 {
        match self {
            TranscriptEntry::Record(record) => record.entry,
            TranscriptEntry::Revision(revision) => revision.entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub plan_id: PlanId,
    pub task_description: String,
    /// Active agent sequence. Empty until sequencing succeeds.
    #[serde(default)]
    pub sequence: Vec<AgentStep>,
    /// Metadata returned by the sequence provider alongside the sequence.
    #[serde(default)]
    pub sequence_metadata: Map<String, Value>,
    /// Sequences replaced by a plan revision, oldest first.
    #[serde(default)]
    pub superseded_sequences: Vec<Vec<AgentStep>>,
    /// Append-only.
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
    /// Append-only.
    #[serde(default)]
    pub revisions: Vec<RevisionEntry>,
    pub current_step_index: usize,
    /// Post-agent revisions accepted so far.
    pub revision_count: u32,
    /// Plan-approval revisions accepted so far.
    #[serde(default)]
    pub plan_revision_count: u32,
    #[serde(default)]
    pub pending_checkpoint: Option<PendingCheckpoint>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Sequence number of the last emitted event.
    #[serde(default)]
    pub event_seq: u64,
    /// Next value for the entry order shared by records and revisions.
    #[serde(default)]
    pub next_entry: u64,
    /// Times this plan was picked up again after a process restart.
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub last_restart_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(plan: &Plan) -> Self {
        Self {
            plan_id: plan.plan_id,
            task_description: plan.task_description.clone(),
            sequence: Vec::new(),
            sequence_metadata: Map::new(),
            superseded_sequences: Vec::new(),
            history: Vec::new(),
            revisions: Vec::new(),
            current_step_index: 0,
            revision_count: 0,
            plan_revision_count: 0,
            pending_checkpoint: None,
            cancel_requested: false,
            event_seq: 0,
            next_entry: 0,
            restarts: 0,
            last_restart_at: None,
        }
    }

    /// The step at `current_step_index`, if any remain.
    pub fn current_step(&self) -> Option<&AgentStep> {
        self.sequence.get(self.current_step_index)
    }

    pub fn is_sequence_finished(&self) -> bool {
        self.current_step_index >= self.sequence.len()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.sequence.iter().map(|s| s.agent_id.clone()).collect()
    }

    /// Replace the active sequence, keeping the previous one.
    pub fn replace_sequence(&mut self, steps: Vec<AgentStep>, metadata: Map<String, Value>) {
        let previous = std::mem::replace(&mut self.sequence, steps);
        if !previous.is_empty() {
            self.superseded_sequences.push(previous);
        }
        self.sequence_metadata = metadata;
        self.current_step_index = 0;
    }

    pub fn records_for(&self, ordinal: usize) -> impl Iterator<Item = &ExecutionRecord> {
        self.history.iter().filter(move |r| r.ordinal == ordinal)
    }

    pub fn revisions_for(&self, ordinal: usize) -> impl Iterator<Item = &RevisionEntry> {
        self.revisions
            .iter()
            .filter(move |r| r.ordinal == Some(ordinal))
    }

    /// Texts of every plan-approval revision, oldest first.
    pub fn plan_revisions(&self) -> Vec<String> {
        self.revisions
            .iter()
            .filter(|r| r.kind == CheckpointKind::PlanApproval)
            .map(|r| r.text.clone())
            .collect()
    }

    /// Iteration number the next invocation of `ordinal` will carry.
    pub fn next_iteration(&self, ordinal: usize) -> u32 {
        self.records_for(ordinal).count() as u32 + 1
    }

    /// Most recent revision note for a step, if the human asked for one.
    pub fn latest_feedback(&self, ordinal: usize) -> Option<&str> {
        self.revisions_for(ordinal).last().map(|r| r.text.as_str())
    }

    fn take_entry(&mut self) -> u64 {
        let entry = self.next_entry;
        self.next_entry += 1;
        entry
    }

    /// Append a successful invocation and return its history index.
    pub fn append_result(&mut self, step: &AgentStep, result_message: Value, attempts: u32) -> usize {
        let record = ExecutionRecord {
            agent_id: step.agent_id.clone(),
            ordinal: step.ordinal,
            iteration: self.next_iteration(step.ordinal),
            result_message,
            failure: None,
            attempts,
            entry: self.take_entry(),
            timestamp: Utc::now(),
        };
        self.history.push(record);
        self.history.len() - 1
    }

    /// Append an invocation whose retries were exhausted.
    pub fn append_failure(&mut self, step: &AgentStep, failure: StepFailure, attempts: u32) -> usize {
        let result_message = serde_json::json!({
            "error": failure.kind,
            "reason": failure.reason,
            "attempts": attempts,
        });
        let record = ExecutionRecord {
            agent_id: step.agent_id.clone(),
            ordinal: step.ordinal,
            iteration: self.next_iteration(step.ordinal),
            result_message,
            failure: Some(failure),
            attempts,
            entry: self.take_entry(),
            timestamp: Utc::now(),
        };
        self.history.push(record);
        self.history.len() - 1
    }

    /// Record human feedback given at a checkpoint.
    pub fn append_revision(
        &mut self,
        kind: CheckpointKind,
        request_id: RequestId,
        step: Option<&AgentStep>,
        text: impl Into<String>,
    ) {
        let entry = self.take_entry();
        self.revisions.push(RevisionEntry {
            kind,
            request_id,
            ordinal: step.map(|s| s.ordinal),
            agent_id: step.map(|s| s.agent_id.clone()),
            text: text.into(),
            entry,
            timestamp: Utc::now(),
        });
        match kind {
            CheckpointKind::PlanApproval => self.plan_revision_count += 1,
            CheckpointKind::PostAgentReview => self.revision_count += 1,
        }
    }

    /// Open a checkpoint. Only one may be open per plan.
    pub fn open_checkpoint(&mut self, checkpoint: PendingCheckpoint) -> Result<RequestId> {
        if let Some(open) = &self.pending_checkpoint {
            return Err(Error::Validation(format!(
                "plan {} already has open checkpoint {}",
                self.plan_id, open.request_id
            )));
        }
        let request_id = checkpoint.request_id;
        self.pending_checkpoint = Some(checkpoint);
        Ok(request_id)
    }

    /// Close the open checkpoint if it matches `request_id`.
    ///
    /// Returns `None` when nothing matching is open, which callers treat as
    /// an already-closed checkpoint.
    pub fn close_checkpoint(&mut self, request_id: RequestId) -> Option<PendingCheckpoint> {
        match &self.pending_checkpoint {
            Some(open) if open.request_id == request_id => self.pending_checkpoint.take(),
            _ => None,
        }
    }

    /// The record a post-agent checkpoint is attached to.
    pub fn checkpoint_record(&self) -> Option<&ExecutionRecord> {
        self.pending_checkpoint
            .as_ref()
            .and_then(|cp| cp.record_index)
            .and_then(|idx| self.history.get(idx))
    }

    /// Allocate the sequence number of the next event.
    pub fn next_event_seq(&mut self) -> u64 {
        self.event_seq += 1;
        self.event_seq
    }

    /// Records and revision notes interleaved in the order they happened.
    pub fn transcript(&self) -> Vec<TranscriptEntry<'_>> {
        let mut entries: Vec<TranscriptEntry<'_>> = self
            .history
            .iter()
            .map(TranscriptEntry::Record)
            .chain(self.revisions.iter().map(TranscriptEntry::Revision))
            .collect();
        entries.sort_by_key(|e| e.entry());
        entries
    }

    /// Mark that the plan was picked up after a process restart.
    pub fn mark_restart(&mut self) {
        self.restarts += 1;
        self.last_restart_at = Some(Utc::now());
    }
}

/// Durable record of one plan: the plan row, its context and the version
/// used for optimistic-concurrency writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// 0 until first persisted; each successful save increments it.
    pub version: u64,
    pub plan: Plan,
    pub context: ExecutionContext,
}

impl Snapshot {
    pub fn new(plan: Plan) -> Self {
        let context = ExecutionContext::new(&plan);
        Self {
            version: 0,
            plan,
            context,
        }
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan.plan_id
    }

    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }
}
