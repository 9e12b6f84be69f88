//! Workflow executor.
//!
//! Drives each plan through its state machine:
//!
//! ```text
//! Sequencing -> PlanReview -> StepRunning -> StepReview? -> StepRunning ... -> Terminal
//!                  ^   |                        |  ^
//!                  +---+ (revise)               +--+ (revise: same step)
//! ```
//!
//! Every transition is written to the [`DurableStore`] first and announced on
//! the plan's event channel only after the write succeeded. A plan is only
//! ever touched by one task at a time: each operation takes the plan's lock,
//! loads the latest snapshot, runs to the next suspension point and releases
//! the lock. Nothing about a plan lives in memory between operations except
//! the open-checkpoint index. While an operation drives a plan, the plan's
//! cancellation token is registered so [`WorkflowExecutor::cancel`] can
//! reach it without waiting for the lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::state::{DurableStore, PlanSummary};
use crate::util::backoff_delay;
use crate::workflow::{
    transition, AgentStep, CheckpointKind, ClarificationRequest, ClarificationResponse, Decision,
    ExecutorState, FailureKind, PendingCheckpoint, Plan, PlanId, PlanStatus, RequestId,
    ResponseAck, Snapshot, StepFailure, SubmissionReceipt, TaskSubmission,
};

use super::checkpoint::CheckpointRegistry;
use super::events::{EventKind, EventPump, EventSink, PlanEvent, StepStream};
use super::registry::{Agent, AgentCall, AgentOutput, AgentRegistry};
use super::sequence::{validate_proposal, SequenceProvider, SequenceRequest};

/// A checkpoint made answerable again by [`WorkflowExecutor::recover`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredCheckpoint {
    pub plan_id: PlanId,
    pub request_id: RequestId,
    pub kind: CheckpointKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Suspended plans whose checkpoint accepts responses again.
    pub reregistered: Vec<RecoveredCheckpoint>,
    /// Plans that stopped while sequencing or running a step. They stay put
    /// until [`WorkflowExecutor::resume`] is called for them.
    pub interrupted: Vec<PlanId>,
    /// Plans another executor recovered first.
    pub conflicts: Vec<PlanId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The plan is being driven; it is rejected before its next step, or
    /// once the running agent returns.
    Signalled,
    /// The plan was rejected immediately.
    Rejected,
}

enum StepOutcome {
    Succeeded { output: AgentOutput, attempts: u32 },
    Exhausted { failure: StepFailure, attempts: u32 },
    Cancelled,
}

enum Recovered {
    Checkpoint(RecoveredCheckpoint),
    Interrupted,
    Conflict,
    Gone,
}

pub struct WorkflowExecutor {
    agents: Arc<AgentRegistry>,
    sequencer: Arc<dyn SequenceProvider>,
    store: Arc<dyn DurableStore>,
    events: EventPump,
    checkpoints: CheckpointRegistry,
    config: ExecutorConfig,
    plan_locks: Mutex<HashMap<PlanId, Arc<Mutex<()>>>>,
    in_flight: Mutex<HashMap<PlanId, CancellationToken>>,
}

impl WorkflowExecutor {
    pub fn new(
        agents: Arc<AgentRegistry>,
        sequencer: Arc<dyn SequenceProvider>,
        store: Arc<dyn DurableStore>,
        sink: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        let events = EventPump::new(sink, config.event_buffer);
        Self {
            agents,
            sequencer,
            store,
            events,
            checkpoints: CheckpointRegistry::new(),
            config,
            plan_locks: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Create a plan for the task and run it up to the plan-approval
    /// checkpoint (or to `failed` if no valid sequence comes back).
    pub async fn submit(&self, submission: TaskSubmission) -> Result<SubmissionReceipt> {
        if submission.task_description.trim().is_empty() {
            return Err(Error::Validation(
                "task_description must be non-empty".to_string(),
            ));
        }
        let session_id = submission.session_id.unwrap_or_default();
        let plan = Plan::new(submission.task_description, session_id);
        let plan_id = plan.plan_id;
        let _guard = self.lock_plan(plan_id).await;

        let mut snapshot = Snapshot::new(plan);
        let created = EventKind::PlanCreated {
            session_id,
            task_description: snapshot.plan.task_description.clone(),
        };
        self.commit(&mut snapshot, Some(created)).await?;
        tracing::info!(plan_id = %plan_id, session_id = %session_id, "plan submitted");

        self.drive(&mut snapshot).await?;
        Ok(SubmissionReceipt {
            plan_id,
            session_id,
            status: snapshot.status(),
        })
    }

    /// Deliver a human decision for an open checkpoint and run the plan to
    /// its next suspension point.
    ///
    /// A response that matches no open checkpoint is acknowledged as
    /// `stale_checkpoint` and changes nothing, so redelivery is harmless.
    pub async fn respond(&self, response: ClarificationResponse) -> Result<ResponseAck> {
        let ClarificationResponse {
            request_id,
            plan_id,
            decision,
            revision_text,
        } = response;

        let revision_text = match decision {
            Decision::Revise => match revision_text {
                Some(text) if !text.trim().is_empty() => Some(text),
                _ => {
                    return Err(Error::Validation(
                        "revise requires a non-empty revision_text".to_string(),
                    ))
                }
            },
            Decision::Approve | Decision::Abort => None,
        };

        if !self.checkpoints.matches(request_id, plan_id).await {
            tracing::warn!(plan_id = %plan_id, request_id = %request_id, "response for unknown checkpoint");
            return Ok(ResponseAck::stale());
        }

        let _guard = self.lock_plan(plan_id).await;
        let Some(mut snapshot) = self.store.load(plan_id).await? else {
            self.checkpoints.close(request_id).await;
            tracing::warn!(plan_id = %plan_id, request_id = %request_id, "response for missing plan");
            return Ok(ResponseAck::stale());
        };
        let Some(checkpoint) = snapshot.context.close_checkpoint(request_id) else {
            self.checkpoints.close(request_id).await;
            tracing::warn!(plan_id = %plan_id, request_id = %request_id, "checkpoint already closed");
            return Ok(ResponseAck::stale());
        };
        tracing::info!(
            plan_id = %plan_id,
            request_id = %request_id,
            kind = %checkpoint.kind,
            decision = %decision,
            "checkpoint response accepted"
        );

        let result = self
            .apply_decision(&mut snapshot, checkpoint, decision, revision_text)
            .await;

        // The checkpoint stays answerable only if its closing never reached
        // the store.
        let still_open = match &result {
            Ok(()) => false,
            Err(_) => self
                .store
                .load(plan_id)
                .await
                .ok()
                .flatten()
                .and_then(|s| s.context.pending_checkpoint)
                .is_some_and(|cp| cp.request_id == request_id),
        };
        if !still_open {
            self.checkpoints.close(request_id).await;
        }

        result?;
        Ok(ResponseAck::accepted(snapshot.status()))
    }

    /// Cancel a plan that has not terminated.
    ///
    /// A plan waiting on a checkpoint is rejected at once. A plan that is
    /// being driven is signalled: it is rejected before its next step, and a
    /// running agent is left to finish with its result discarded.
    pub async fn cancel(&self, plan_id: PlanId) -> Result<CancelOutcome> {
        if let Some(token) = self.in_flight.lock().await.get(&plan_id) {
            token.cancel();
            tracing::info!(plan_id = %plan_id, "cancellation signalled to driven plan");
            return Ok(CancelOutcome::Signalled);
        }

        let _guard = self.lock_plan(plan_id).await;
        let mut snapshot = self.load_snapshot(plan_id).await?;
        if snapshot.status().is_terminal() {
            return Err(Error::PlanTerminal(plan_id));
        }
        snapshot.context.cancel_requested = true;
        self.finish(
            &mut snapshot,
            PlanStatus::Rejected,
            Some("cancelled".to_string()),
        )
        .await?;
        Ok(CancelOutcome::Rejected)
    }

    /// Pick up every unfinished plan after a process start.
    ///
    /// Open checkpoints become answerable again; no agent is invoked. Each
    /// suspended snapshot has its restart marker bumped with a
    /// compare-and-swap write, so a checkpoint is recovered by one executor
    /// only. Plans found sequencing or mid-step are reported and left
    /// untouched, since another executor may still be running them.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for summary in self.store.list().await? {
            if summary.status.is_terminal() {
                continue;
            }
            match self.recover_one(summary.plan_id).await? {
                Recovered::Checkpoint(checkpoint) => report.reregistered.push(checkpoint),
                Recovered::Interrupted => report.interrupted.push(summary.plan_id),
                Recovered::Conflict => report.conflicts.push(summary.plan_id),
                Recovered::Gone => {}
            }
        }

        tracing::info!(
            reregistered = report.reregistered.len(),
            interrupted = report.interrupted.len(),
            conflicts = report.conflicts.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// Recover a single plan, making its open checkpoint answerable.
    ///
    /// Returns `None` when the plan is not waiting on a checkpoint or another
    /// executor recovered it first.
    pub async fn recover_plan(&self, plan_id: PlanId) -> Result<Option<RecoveredCheckpoint>> {
        match self.recover_one(plan_id).await? {
            Recovered::Checkpoint(checkpoint) => Ok(Some(checkpoint)),
            _ => Ok(None),
        }
    }

    async fn recover_one(&self, plan_id: PlanId) -> Result<Recovered> {
        let _guard = self.lock_plan(plan_id).await;
        let Some(mut snapshot) = self.store.load(plan_id).await? else {
            return Ok(Recovered::Gone);
        };
        if snapshot.status().is_terminal() {
            return Ok(Recovered::Gone);
        }

        let checkpoint = match &snapshot.context.pending_checkpoint {
            Some(cp) if snapshot.status().is_awaiting() => RecoveredCheckpoint {
                plan_id,
                request_id: cp.request_id,
                kind: cp.kind,
            },
            _ => {
                tracing::warn!(plan_id = %plan_id, status = %snapshot.status(), "plan was interrupted");
                return Ok(Recovered::Interrupted);
            }
        };

        snapshot.context.mark_restart();
        match self.persist(&mut snapshot).await {
            Ok(()) => {}
            Err(Error::VersionConflict { .. }) => {
                tracing::warn!(plan_id = %plan_id, "plan recovered concurrently, skipping");
                return Ok(Recovered::Conflict);
            }
            Err(e) => return Err(e),
        }

        self.checkpoints.open(checkpoint.request_id, plan_id).await;
        tracing::info!(
            plan_id = %plan_id,
            request_id = %checkpoint.request_id,
            kind = %checkpoint.kind,
            "checkpoint re-registered"
        );
        Ok(Recovered::Checkpoint(checkpoint))
    }

    /// Re-drive a plan from its last persisted state.
    ///
    /// A plan interrupted mid-step re-invokes that step. Suspended plans are
    /// left as they are.
    pub async fn resume(&self, plan_id: PlanId) -> Result<PlanStatus> {
        let _guard = self.lock_plan(plan_id).await;
        let mut snapshot = self.load_snapshot(plan_id).await?;
        if snapshot.status().is_terminal() {
            return Err(Error::PlanTerminal(plan_id));
        }
        tracing::info!(plan_id = %plan_id, status = %snapshot.status(), "resuming plan");
        self.drive(&mut snapshot).await?;
        Ok(snapshot.status())
    }

    pub async fn snapshot(&self, plan_id: PlanId) -> Result<Snapshot> {
        self.load_snapshot(plan_id).await
    }

    pub async fn plans(&self) -> Result<Vec<PlanSummary>> {
        self.store.list().await
    }

    /// The checkpoint a plan is waiting on, as shown to a reviewer.
    pub async fn pending_request(&self, plan_id: PlanId) -> Result<Option<ClarificationRequest>> {
        let snapshot = self.load_snapshot(plan_id).await?;
        Ok(clarification_request(&snapshot))
    }

    /// Wait until every event emitted so far for the plan reached the sink.
    pub async fn flush_events(&self, plan_id: PlanId) {
        self.events.flush(plan_id).await;
    }

    /// Flush every plan's events.
    pub async fn shutdown(&self) {
        self.events.close_all().await;
    }

    async fn lock_plan(&self, plan_id: PlanId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.plan_locks.lock().await;
            // An entry only the map refers to is neither held nor awaited.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(plan_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn load_snapshot(&self, plan_id: PlanId) -> Result<Snapshot> {
        self.store
            .load(plan_id)
            .await?
            .ok_or(Error::PlanNotFound(plan_id))
    }

    /// Run until the plan suspends or terminates, with the plan's
    /// cancellation token registered for the whole run.
    async fn drive(&self, snapshot: &mut Snapshot) -> Result<()> {
        let plan_id = snapshot.plan_id();
        let token = CancellationToken::new();
        self.in_flight.lock().await.insert(plan_id, token.clone());
        let result = self.drive_until_suspended(snapshot, &token).await;
        let cancelled = self
            .in_flight
            .lock()
            .await
            .remove(&plan_id)
            .is_some_and(|token| token.is_cancelled());
        result?;

        // Signalled after the last check in the loop.
        if cancelled && !snapshot.status().is_terminal() {
            self.reject_cancelled(snapshot, "cancelled".to_string()).await?;
        }
        Ok(())
    }

    /// A loop, so revision cycles never grow the stack.
    async fn drive_until_suspended(&self, snapshot: &mut Snapshot, token: &CancellationToken) -> Result<()> {
        loop {
            let state = ExecutorState::from(snapshot.status());
            if token.is_cancelled() && state != ExecutorState::Terminal {
                return self.reject_cancelled(snapshot, "cancelled".to_string()).await;
            }
            match state {
                ExecutorState::Sequencing => self.sequence(snapshot).await?,
                ExecutorState::StepRunning => self.run_step(snapshot, token).await?,
                ExecutorState::PlanReview | ExecutorState::StepReview | ExecutorState::Terminal => {
                    return Ok(())
                }
            }
        }
    }

    async fn reject_cancelled(&self, snapshot: &mut Snapshot, reason: String) -> Result<()> {
        snapshot.context.cancel_requested = true;
        tracing::info!(plan_id = %snapshot.plan_id(), reason = %reason, "rejecting cancelled plan");
        self.finish(snapshot, PlanStatus::Rejected, Some(reason)).await
    }

    async fn apply_decision(
        &self,
        snapshot: &mut Snapshot,
        checkpoint: PendingCheckpoint,
        decision: Decision,
        revision_text: Option<String>,
    ) -> Result<()> {
        let request_id = checkpoint.request_id;
        match (checkpoint.kind, decision) {
            (kind, Decision::Abort) => {
                self.finish(
                    snapshot,
                    PlanStatus::Rejected,
                    Some(format!("aborted at {kind} checkpoint")),
                )
                .await
            }
            (CheckpointKind::PlanApproval, Decision::Approve) => {
                snapshot.context.current_step_index = 0;
                transition(&mut snapshot.plan, PlanStatus::Running, None)?;
                self.drive(snapshot).await
            }
            (CheckpointKind::PlanApproval, Decision::Revise) => {
                snapshot.context.append_revision(
                    CheckpointKind::PlanApproval,
                    request_id,
                    None,
                    revision_text.unwrap_or_default(),
                );
                self.sequence(snapshot).await
            }
            (CheckpointKind::PostAgentReview, Decision::Approve) => {
                snapshot.context.current_step_index += 1;
                if snapshot.context.is_sequence_finished() {
                    self.finish(snapshot, PlanStatus::Completed, None).await
                } else {
                    transition(&mut snapshot.plan, PlanStatus::Running, None)?;
                    self.drive(snapshot).await
                }
            }
            (CheckpointKind::PostAgentReview, Decision::Revise) => {
                let step = snapshot.context.current_step().cloned().ok_or_else(|| {
                    Error::Validation(format!("plan {} has no step under review", snapshot.plan_id()))
                })?;
                snapshot.context.append_revision(
                    CheckpointKind::PostAgentReview,
                    request_id,
                    Some(&step),
                    revision_text.unwrap_or_default(),
                );
                transition(&mut snapshot.plan, PlanStatus::Running, None)?;
                self.drive(snapshot).await
            }
        }
    }

    /// Ask the provider for a sequence and open the plan-approval checkpoint.
    async fn sequence(&self, snapshot: &mut Snapshot) -> Result<()> {
        let plan_id = snapshot.plan_id();
        let request = SequenceRequest {
            task_description: snapshot.plan.task_description.clone(),
            revisions: snapshot.context.plan_revisions(),
        };

        let proposal = match self.sequencer.generate(&request).await {
            Ok(proposal) => proposal,
            Err(e) => {
                tracing::error!(plan_id = %plan_id, error = %e, "sequence provider failed");
                let reason = match e {
                    Error::SequencingFailure(_) => e.to_string(),
                    other => Error::SequencingFailure(other.to_string()).to_string(),
                };
                return self.finish(snapshot, PlanStatus::Failed, Some(reason)).await;
            }
        };
        let steps = match validate_proposal(&proposal, &self.config.planning_agent, &self.agents) {
            Ok(steps) => steps,
            Err(e) => {
                tracing::error!(plan_id = %plan_id, error = %e, sequence = ?proposal.agent_ids, "invalid sequence");
                return self
                    .finish(snapshot, PlanStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        snapshot.context.replace_sequence(steps, proposal.metadata);
        let request_id = snapshot
            .context
            .open_checkpoint(PendingCheckpoint::plan_approval())?;
        transition(&mut snapshot.plan, PlanStatus::AwaitingPlanApproval, None)?;
        let event = EventKind::PlanApprovalRequested {
            request_id,
            kind: CheckpointKind::PlanApproval,
            sequence: snapshot.context.agent_ids(),
        };
        self.suspend(snapshot, request_id, event).await
    }

    /// Invoke the agent at `current_step_index`, then advance, open a review
    /// or terminate.
    async fn run_step(&self, snapshot: &mut Snapshot, token: &CancellationToken) -> Result<()> {
        let plan_id = snapshot.plan_id();
        let Some(step) = snapshot.context.current_step().cloned() else {
            return self.finish(snapshot, PlanStatus::Completed, None).await;
        };
        let agent = match self.agents.resolve(&step.agent_id) {
            Ok(agent) => agent,
            Err(e) => {
                return self
                    .finish(snapshot, PlanStatus::Failed, Some(e.to_string()))
                    .await
            }
        };

        let iteration = snapshot.context.next_iteration(step.ordinal);
        let started = EventKind::StepStarted {
            agent_id: step.agent_id.clone(),
            ordinal: step.ordinal,
            iteration,
        };
        self.commit(snapshot, Some(started)).await?;
        tracing::info!(plan_id = %plan_id, agent_id = %step.agent_id, ordinal = step.ordinal, iteration, "step started");

        let outcome = self
            .invoke_with_retry(snapshot, &step, agent.as_ref(), iteration, token)
            .await;

        match outcome {
            StepOutcome::Cancelled => {
                let reason = format!("cancelled while {} was running", step.agent_id);
                self.reject_cancelled(snapshot, reason).await
            }
            StepOutcome::Succeeded { output, attempts } => {
                let record_index =
                    snapshot
                        .context
                        .append_result(&step, output.message.clone(), attempts);
                let review =
                    output.needs_revision || self.config.review.requires_review(&step.agent_id);
                if !review {
                    snapshot.context.current_step_index += 1;
                }
                let completed = EventKind::StepCompleted {
                    agent_id: step.agent_id.clone(),
                    ordinal: step.ordinal,
                    iteration,
                    result_message: output.message,
                };
                self.commit(snapshot, Some(completed)).await?;
                tracing::info!(plan_id = %plan_id, agent_id = %step.agent_id, attempts, review, "step completed");

                if review {
                    self.open_review(snapshot, record_index, output.needs_revision)
                        .await
                } else {
                    Ok(())
                }
            }
            StepOutcome::Exhausted { failure, attempts } => {
                tracing::error!(
                    plan_id = %plan_id,
                    agent_id = %step.agent_id,
                    attempts,
                    reason = %failure.reason,
                    "step failed, escalating to review"
                );
                let record_index = snapshot.context.append_failure(&step, failure, attempts);
                self.open_review(snapshot, record_index, false).await
            }
        }
    }

    async fn invoke_with_retry(
        &self,
        snapshot: &mut Snapshot,
        step: &AgentStep,
        agent: &dyn Agent,
        iteration: u32,
        token: &CancellationToken,
    ) -> StepOutcome {
        let plan_id = snapshot.plan_id();
        let timeout = self.config.timeout_for(&step.agent_id);
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let stream = StepStream::new(
                plan_id,
                step.agent_id.clone(),
                step.ordinal,
                self.events.sender(plan_id).await,
                snapshot.context.event_seq,
            );
            let call = AgentCall {
                context: &snapshot.context,
                step,
                iteration,
                attempt,
                stream: &stream,
            };
            let result = tokio::time::timeout(timeout, agent.invoke(call)).await;
            snapshot.context.event_seq = stream.into_last_seq();

            if token.is_cancelled() {
                tracing::info!(plan_id = %plan_id, agent_id = %step.agent_id, "discarding result of cancelled step");
                return StepOutcome::Cancelled;
            }

            let failure = match result {
                Ok(Ok(output)) => {
                    return StepOutcome::Succeeded {
                        output,
                        attempts: attempt,
                    }
                }
                Ok(Err(e)) => StepFailure {
                    kind: FailureKind::Error,
                    reason: Error::AgentInvocationError {
                        agent_id: step.agent_id.clone(),
                        message: e.message,
                    }
                    .to_string(),
                },
                Err(_) => StepFailure {
                    kind: FailureKind::Timeout,
                    reason: Error::AgentInvocationTimeout {
                        agent_id: step.agent_id.clone(),
                        timeout,
                    }
                    .to_string(),
                },
            };

            if attempt >= max_attempts {
                return StepOutcome::Exhausted {
                    failure,
                    attempts: attempt,
                };
            }

            let delay = backoff_delay(self.config.retry_backoff, attempt, self.config.max_backoff);
            tracing::warn!(
                plan_id = %plan_id,
                agent_id = %step.agent_id,
                attempt,
                kind = %failure.kind,
                reason = %failure.reason,
                delay_ms = delay.as_millis() as u64,
                "agent invocation failed, retrying"
            );
            tokio::select! {
                _ = token.cancelled() => return StepOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Open a post-agent review on the record at `record_index`.
    async fn open_review(
        &self,
        snapshot: &mut Snapshot,
        record_index: usize,
        needs_revision: bool,
    ) -> Result<()> {
        let record = snapshot
            .context
            .history
            .get(record_index)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("no execution record at {record_index}")))?;
        let request_id = snapshot
            .context
            .open_checkpoint(PendingCheckpoint::post_agent_review(record_index))?;
        transition(&mut snapshot.plan, PlanStatus::AwaitingRevision, None)?;
        let event = EventKind::PostAgentReviewRequested {
            request_id,
            kind: CheckpointKind::PostAgentReview,
            agent_id: record.agent_id,
            ordinal: record.ordinal,
            iteration: record.iteration,
            result_message: record.result_message,
            error: record.failure,
            needs_revision,
        };
        self.suspend(snapshot, request_id, event).await
    }

    /// Commit a transition that opened a checkpoint and make the checkpoint
    /// answerable.
    async fn suspend(&self, snapshot: &mut Snapshot, request_id: RequestId, event: EventKind) -> Result<()> {
        let plan_id = snapshot.plan_id();
        self.checkpoints.open(request_id, plan_id).await;
        if let Err(e) = self.commit(snapshot, Some(event)).await {
            self.checkpoints.close(request_id).await;
            return Err(e);
        }
        tracing::info!(plan_id = %plan_id, request_id = %request_id, status = %snapshot.status(), "plan suspended");
        Ok(())
    }

    async fn finish(&self, snapshot: &mut Snapshot, status: PlanStatus, reason: Option<String>) -> Result<()> {
        let plan_id = snapshot.plan_id();
        let event = match status {
            PlanStatus::Completed => EventKind::PlanCompleted,
            PlanStatus::Rejected => EventKind::PlanRejected {
                reason: reason.clone().unwrap_or_else(|| "rejected".to_string()),
            },
            PlanStatus::Failed => EventKind::PlanFailed {
                reason: reason.clone().unwrap_or_else(|| "failed".to_string()),
            },
            other => {
                return Err(Error::InvalidTransition {
                    from: snapshot.status(),
                    to: other,
                })
            }
        };

        let closed = snapshot.context.pending_checkpoint.take();
        transition(&mut snapshot.plan, status, reason)?;
        self.commit(snapshot, Some(event)).await?;
        if let Some(checkpoint) = closed {
            self.checkpoints.close(checkpoint.request_id).await;
        }
        self.events.close(plan_id).await;

        match status {
            PlanStatus::Completed => tracing::info!(plan_id = %plan_id, "plan completed"),
            _ => tracing::warn!(
                plan_id = %plan_id,
                status = %status,
                reason = snapshot.plan.terminal_reason.as_deref().unwrap_or(""),
                "plan terminated"
            ),
        }
        Ok(())
    }

    /// Persist the snapshot, then emit `event` with the next sequence number.
    async fn commit(&self, snapshot: &mut Snapshot, event: Option<EventKind>) -> Result<()> {
        snapshot.plan.updated_at = Utc::now();
        let seq = event.as_ref().map(|_| snapshot.context.next_event_seq());
        self.persist(snapshot).await?;

        if let (Some(seq), Some(kind)) = (seq, event) {
            let plan_id = snapshot.plan_id();
            if let Err(e) = self.events.emit(PlanEvent::new(plan_id, seq, kind)).await {
                tracing::error!(plan_id = %plan_id, seq, error = %e, "event not delivered");
            }
        }
        Ok(())
    }

    /// Write the snapshot, retrying transient store failures. Version
    /// conflicts are returned at once.
    async fn persist(&self, snapshot: &mut Snapshot) -> Result<()> {
        let plan_id = snapshot.plan_id();
        let mut retry = 0;
        loop {
            match self.store.save(snapshot).await {
                Ok(version) => {
                    snapshot.version = version;
                    tracing::debug!(plan_id = %plan_id, version, status = %snapshot.status(), "snapshot persisted");
                    return Ok(());
                }
                Err(e) if e.is_retryable_persistence() && retry < self.config.persist_retries => {
                    retry += 1;
                    tracing::warn!(plan_id = %plan_id, retry, error = %e, "snapshot write failed, retrying");
                    tokio::time::sleep(backoff_delay(
                        self.config.retry_backoff,
                        retry,
                        self.config.max_backoff,
                    ))
                    .await;
                }
                Err(e) if e.is_retryable_persistence() => {
                    tracing::error!(plan_id = %plan_id, error = %e, "snapshot write failed, giving up");
                    return Err(Error::PersistenceFailure(format!("plan {plan_id}: {e}")));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn clarification_request(snapshot: &Snapshot) -> Option<ClarificationRequest> {
    let context = &snapshot.context;
    let checkpoint = context.pending_checkpoint.as_ref()?;
    let presented_payload = match checkpoint.kind {
        CheckpointKind::PlanApproval => json!({
            "sequence": context.agent_ids(),
            "metadata": context.sequence_metadata,
            "revisions": context.plan_revisions(),
        }),
        CheckpointKind::PostAgentReview => match context.checkpoint_record() {
            Some(record) => json!({
                "agent_id": record.agent_id,
                "ordinal": record.ordinal,
                "iteration": record.iteration,
                "result_message": record.result_message,
                "error": record.failure,
            }),
            None => Value::Null,
        },
    };
    Some(ClarificationRequest {
        request_id: checkpoint.request_id,
        plan_id: snapshot.plan_id(),
        kind: checkpoint.kind,
        presented_payload,
        opened_at: checkpoint.opened_at,
    })
}
