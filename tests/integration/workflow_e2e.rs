//! End-to-end workflow tests.
//!
//! These tests run plans from submission to a terminal status and check the
//! checkpoints opened on the way and the events delivered for each plan.

use std::sync::{Arc, Mutex};

use serde_json::json;

use agentflow::config::RouteRule;
use agentflow::orchestration::{EventKind, KeywordSequenceProvider};
use agentflow::state::MemoryStore;
use agentflow::workflow::{CheckpointKind, PlanStatus, ResponseStatus};
use agentflow::{ExecutorConfig, ReviewPolicy};

use crate::fixtures::{
    assert_contiguous_seqs, config_with_review, registry_with, Behavior, Harness, ScriptedAgent,
};

/// Test: Approving every checkpoint completes the plan
/// Given a sequence of planning, invoice and vendor agents
/// When the plan and both reviewed steps are approved
/// Then each agent ran once in order and the event stream is complete
#[tokio::test]
async fn test_full_approval_flow() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let planning = ScriptedAgent::logging("planning", Arc::clone(&order));
    let invoice = ScriptedAgent::logging("invoice", Arc::clone(&order));
    let vendor = ScriptedAgent::logging("vendor", Arc::clone(&order));
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice, &vendor]),
        &["planning", "invoice", "vendor"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice INV-1").await;
    assert_eq!(receipt.status, PlanStatus::AwaitingPlanApproval);
    assert!(order.lock().unwrap().is_empty(), "No agent runs before plan approval");

    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));
    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));
    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::Completed));

    assert_eq!(
        *order.lock().unwrap(),
        vec!["planning", "invoice", "vendor"]
    );

    let snapshot = harness.snapshot(receipt.plan_id).await;
    assert_eq!(snapshot.status(), PlanStatus::Completed);
    assert_eq!(snapshot.context.history.len(), 3);
    assert_eq!(snapshot.context.revision_count, 0);
    assert!(snapshot.context.pending_checkpoint.is_none());

    assert_eq!(
        harness.event_names(receipt.plan_id).await,
        vec![
            "plan_created",
            "plan_approval_requested",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "post_agent_review_requested",
            "step_started",
            "step_completed",
            "post_agent_review_requested",
            "plan_completed",
        ]
    );
    let events = harness.events(receipt.plan_id).await;
    assert_contiguous_seqs(&events);
    assert!(events.last().unwrap().is_terminal());
}

/// Test: Review policy `none` runs straight through
/// Given a plan whose agents are never reviewed
/// When the sequence is approved
/// Then the plan completes without another checkpoint
#[tokio::test]
async fn test_no_review_policy() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        config_with_review(ReviewPolicy::None),
    );

    let receipt = harness.submit("check invoice INV-2").await;
    let ack = harness.approve(receipt.plan_id).await;

    assert_eq!(ack.plan_status, Some(PlanStatus::Completed));
    assert_eq!(invoice.call_count(), 1);
    let names = harness.event_names(receipt.plan_id).await;
    assert!(!names.contains(&"post_agent_review_requested"));
    assert_eq!(names.last(), Some(&"plan_completed"));
}

/// Test: Plan revision regenerates the sequence
/// Given a keyword provider routing on "vendor"
/// When the reviewer asks to also check the vendor
/// Then a new sequence is proposed, the old one is kept and the old request
/// is stale
#[tokio::test]
async fn test_plan_revision_resequences() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let vendor = ScriptedAgent::new("vendor");
    let routes = vec![
        RouteRule {
            keywords: vec!["invoice".to_string()],
            agents: vec!["invoice".to_string()],
        },
        RouteRule {
            keywords: vec!["vendor".to_string()],
            agents: vec!["vendor".to_string()],
        },
    ];
    let provider = KeywordSequenceProvider::new("planning", &routes, vec!["invoice".to_string()])
        .expect("Failed to compile routes");
    let harness = Harness::new(
        registry_with(&[&planning, &invoice, &vendor]),
        Arc::new(provider),
        Arc::new(MemoryStore::new()),
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice INV-3").await;
    let first_request = harness.open_request(receipt.plan_id).await;
    let snapshot = harness.snapshot(receipt.plan_id).await;
    assert_eq!(snapshot.context.agent_ids(), vec!["planning", "invoice"]);

    let ack = harness
        .revise(receipt.plan_id, "also verify the vendor record")
        .await;
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingPlanApproval));

    let snapshot = harness.snapshot(receipt.plan_id).await;
    assert_eq!(
        snapshot.context.agent_ids(),
        vec!["planning", "invoice", "vendor"]
    );
    assert_eq!(snapshot.context.plan_revision_count, 1);
    assert_eq!(snapshot.context.superseded_sequences.len(), 1);
    assert_eq!(
        snapshot.context.plan_revisions(),
        vec!["also verify the vendor record"]
    );

    let stale = harness
        .executor
        .respond(agentflow::ClarificationResponse::approve(
            receipt.plan_id,
            first_request,
        ))
        .await
        .unwrap();
    assert_eq!(stale.status, ResponseStatus::StaleCheckpoint);

    let request = harness
        .executor
        .pending_request(receipt.plan_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.kind, CheckpointKind::PlanApproval);
    assert_eq!(
        request.presented_payload["revisions"],
        json!(["also verify the vendor record"])
    );

    let names = harness.event_names(receipt.plan_id).await;
    assert_eq!(
        names,
        vec![
            "plan_created",
            "plan_approval_requested",
            "plan_approval_requested"
        ]
    );
}

/// Test: An agent flagging its own output forces a review
/// Given a policy that reviews no agent
/// When the invoice agent returns `needs_revision`
/// Then a post-agent review is opened anyway
#[tokio::test]
async fn test_needs_revision_forces_review() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::with_script(
        "invoice",
        vec![Behavior::NeedsRevision(json!({"total": null}))],
    );
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        config_with_review(ReviewPolicy::None),
    );

    let receipt = harness.submit("check invoice INV-4").await;
    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));

    let events = harness.events(receipt.plan_id).await;
    let review = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::PostAgentReviewRequested {
                agent_id,
                needs_revision,
                result_message,
                ..
            } => Some((agent_id.clone(), *needs_revision, result_message.clone())),
            _ => None,
        })
        .expect("Review should be requested");
    assert_eq!(review, ("invoice".to_string(), true, json!({"total": null})));

    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::Completed));
}

/// Test: Abort at a step review rejects the plan
/// Given a plan waiting on the invoice review
/// When the reviewer aborts
/// Then the plan is rejected and its history is kept
#[tokio::test]
async fn test_abort_at_step_review() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let vendor = ScriptedAgent::new("vendor");
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice, &vendor]),
        &["planning", "invoice", "vendor"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice INV-5").await;
    harness.approve(receipt.plan_id).await;
    let ack = harness.abort(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::Rejected));

    let snapshot = harness.snapshot(receipt.plan_id).await;
    assert_eq!(snapshot.status(), PlanStatus::Rejected);
    assert_eq!(snapshot.context.history.len(), 2);
    assert!(snapshot
        .plan
        .terminal_reason
        .as_deref()
        .unwrap()
        .contains("post_agent_review"));
    assert_eq!(vendor.call_count(), 0);
    assert_eq!(
        harness.event_names(receipt.plan_id).await.last(),
        Some(&"plan_rejected")
    );
}

/// Test: Streamed chunks arrive between start and completion
/// Given an agent that streams two chunks
/// When its step runs
/// Then the chunks are delivered in order with contiguous sequence numbers
#[tokio::test]
async fn test_streaming_chunks_in_order() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::with_script(
        "invoice",
        vec![Behavior::Stream(
            vec!["reading invoice".to_string(), "checking totals".to_string()],
            json!("invoice ok"),
        )],
    );
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice INV-6").await;
    harness.approve(receipt.plan_id).await;
    harness.approve(receipt.plan_id).await;

    let events = harness.events(receipt.plan_id).await;
    assert_contiguous_seqs(&events);

    let chunks: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepStreaming { chunk, .. } => Some(chunk.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["reading invoice", "checking totals"]);

    let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
    let first_chunk = names.iter().position(|n| *n == "step_streaming").unwrap();
    assert_eq!(names[first_chunk - 1], "step_started");
    assert_eq!(names[first_chunk + 2], "step_completed");
}

/// Test: Plans in one session stay separate
/// Given two tasks submitted in the same session
/// When both are listed
/// Then each has its own plan and event stream
#[tokio::test]
async fn test_session_plans_are_independent() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    );

    let session = agentflow::workflow::SessionId::new();
    let first = harness
        .executor
        .submit(agentflow::TaskSubmission::new("first").in_session(session))
        .await
        .unwrap();
    let second = harness
        .executor
        .submit(agentflow::TaskSubmission::new("second").in_session(session))
        .await
        .unwrap();
    assert_ne!(first.plan_id, second.plan_id);
    assert_eq!(first.session_id, second.session_id);

    let plans = harness.executor.plans().await.unwrap();
    assert_eq!(plans.len(), 2);
    assert!(plans.iter().all(|p| p.session_id == session));

    harness.approve(first.plan_id).await;
    assert_eq!(harness.events(second.plan_id).await.len(), 2);
    assert_contiguous_seqs(&harness.events(first.plan_id).await);
}
