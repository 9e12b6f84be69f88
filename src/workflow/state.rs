//! Executor state machine with status transition validation.
//!
//! The executor walks every plan through
//!
//! Sequencing -> PlanReview -> (StepRunning -> StepReview?)* -> Terminal
//!
//! `PlanReview` may loop on itself when the sequence is revised and
//! `StepReview` may loop back to `StepRunning` for the same step. The state is
//! never stored on its own: it is derived from the persisted `PlanStatus`, so
//! a reloaded snapshot always resumes in the right place.

use chrono::Utc;

use crate::error::{Error, Result};

use super::{Plan, PlanStatus};

/// Where the executor is for a given plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Asking the sequence provider for agents.
    Sequencing,
    /// Suspended on the plan-approval checkpoint.
    PlanReview,
    /// Invoking the agent at `current_step_index`.
    StepRunning,
    /// Suspended on a post-agent review checkpoint.
    StepReview,
    /// Completed, rejected or failed.
    Terminal,
}

impl From<PlanStatus> for ExecutorState {
    fn from(status: PlanStatus) -> Self {
        match status {
            PlanStatus::Pending => ExecutorState::Sequencing,
            PlanStatus::AwaitingPlanApproval => ExecutorState::PlanReview,
            PlanStatus::Running => ExecutorState::StepRunning,
            PlanStatus::AwaitingRevision => ExecutorState::StepReview,
            PlanStatus::Completed | PlanStatus::Rejected | PlanStatus::Failed => {
                ExecutorState::Terminal
            }
        }
    }
}

impl ExecutorState {
    /// Whether the executor waits for a human in this state.
    pub fn is_suspended(self) -> bool {
        matches!(self, ExecutorState::PlanReview | ExecutorState::StepReview)
    }
}

impl PlanStatus {
    /// Check if a transition to the target status is valid.
    ///
    /// Valid transitions:
    /// - Pending -> AwaitingPlanApproval | Failed | Rejected
    /// - AwaitingPlanApproval -> AwaitingPlanApproval (revised plan) | Running | Failed | Rejected
    /// - Running -> Running (next step) | AwaitingRevision | Completed | Failed | Rejected
    /// - AwaitingRevision -> Running | Completed | Rejected
    pub fn can_transition_to(self, target: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, target),
            (Pending, AwaitingPlanApproval)
                | (Pending, Failed)
                | (Pending, Rejected)
                | (AwaitingPlanApproval, AwaitingPlanApproval)
                | (AwaitingPlanApproval, Running)
                | (AwaitingPlanApproval, Failed)
                | (AwaitingPlanApproval, Rejected)
                | (Running, Running)
                | (Running, AwaitingRevision)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Rejected)
                | (AwaitingRevision, Running)
                | (AwaitingRevision, Completed)
                | (AwaitingRevision, Rejected)
        )
    }
}

/// Move a plan to `target`, stamping `updated_at`.
///
/// Terminal transitions record `reason` as the plan's terminal reason.
pub fn transition(plan: &mut Plan, target: PlanStatus, reason: Option<String>) -> Result<()> {
    if !plan.status.can_transition_to(target) {
        return Err(Error::InvalidTransition {
            from: plan.status,
            to: target,
        });
    }
    plan.status = target;
    plan.updated_at = Utc::now();
    if target.is_terminal() {
        plan.terminal_reason = reason;
    }
    Ok(())
}
