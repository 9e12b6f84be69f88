//! Concurrent plan tests.
//!
//! Plans run on a multi-threaded runtime here. Each plan must see its own
//! events in order, and a plan blocked in an agent must not hold up others.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use agentflow::orchestration::{CancelOutcome, SequenceProposal, StaticSequenceProvider};
use agentflow::state::MemoryStore;
use agentflow::workflow::PlanStatus;
use agentflow::{Error, ExecutorConfig, ReviewPolicy};

use crate::fixtures::{
    assert_contiguous_seqs, config_with_review, registry_with, Behavior, FlakyStore, Harness,
    ScriptedAgent, ScriptedSequenceProvider,
};

const PLAN_COUNT: usize = 20;

/// Test: Many plans at once
/// Given twenty plans submitted in parallel
/// When each is approved through to completion
/// Then every plan completes with its own contiguous event stream
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_plans_keep_event_order() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let harness = Arc::new(Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    ));

    let mut handles = Vec::new();
    for i in 0..PLAN_COUNT {
        let harness = Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            let receipt = harness.submit(&format!("check invoice INV-{i}")).await;
            harness.approve(receipt.plan_id).await;
            let ack = harness.approve(receipt.plan_id).await;
            (receipt.plan_id, ack.plan_status)
        }));
    }

    let mut plan_ids = Vec::new();
    for handle in handles {
        let (plan_id, status) = handle.await.expect("Plan task panicked");
        assert_eq!(status, Some(PlanStatus::Completed));
        plan_ids.push(plan_id);
    }

    assert_eq!(invoice.call_count(), PLAN_COUNT);
    for plan_id in plan_ids {
        let events = harness.events(plan_id).await;
        assert_eq!(events.len(), 8);
        assert!(events.iter().all(|e| e.plan_id == plan_id));
        assert_contiguous_seqs(&events);
        assert_eq!(events.last().unwrap().name(), "plan_completed");
    }
}

/// Test: Cancelling a plan mid-step
/// Given an agent that is still running
/// When the plan is cancelled and the agent then returns
/// Then its result is discarded and the plan is rejected
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_step() {
    let release = Arc::new(Notify::new());
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::with_script(
        "invoice",
        vec![Behavior::WaitFor(Arc::clone(&release), json!("late result"))],
    );
    let harness = Arc::new(Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    ));

    let receipt = harness.submit("check invoice INV-1").await;
    let plan_id = receipt.plan_id;
    let approving = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.approve(plan_id).await })
    };

    tokio::time::timeout(Duration::from_secs(5), invoice.started.notified())
        .await
        .expect("Agent never started");
    let outcome = harness.executor.cancel(plan_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);

    release.notify_one();
    let ack = approving.await.expect("Approve task panicked");
    assert_eq!(ack.plan_status, Some(PlanStatus::Rejected));

    let snapshot = harness.snapshot(plan_id).await;
    assert_eq!(snapshot.status(), PlanStatus::Rejected);
    assert!(snapshot.context.cancel_requested);
    assert!(snapshot
        .context
        .history
        .iter()
        .all(|r| r.result_message != json!("late result")));
    assert!(!harness
        .event_names(plan_id)
        .await
        .contains(&"post_agent_review_requested"));

    assert!(matches!(
        harness.executor.cancel(plan_id).await,
        Err(Error::PlanTerminal(_))
    ));
}

/// Test: Cancelling between two steps
/// Given a plan that runs its steps without review and slow store writes
/// When the plan is cancelled right after the first step's agent returned
/// Then the next step never runs and the plan is rejected
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_between_steps() {
    let planning = ScriptedAgent::new("planning");
    let audit = ScriptedAgent::new("audit");
    let invoice = ScriptedAgent::new("invoice");
    let store = FlakyStore::new(Arc::new(MemoryStore::new()));
    let harness = Arc::new(Harness::new(
        registry_with(&[&planning, &audit, &invoice]),
        Arc::new(StaticSequenceProvider::new(["planning", "audit", "invoice"])),
        store.clone(),
        config_with_review(ReviewPolicy::None),
    ));

    let receipt = harness.submit("check invoice INV-9").await;
    let plan_id = receipt.plan_id;
    store.slow_saves(Duration::from_millis(100));
    let approving = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.approve(plan_id).await })
    };

    tokio::time::timeout(Duration::from_secs(5), audit.started.notified())
        .await
        .expect("Audit agent never started");
    // The agent answers at once; its step_completed write is still in flight.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let outcome = harness.executor.cancel(plan_id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);

    let ack = approving.await.expect("Approve task panicked");
    assert_eq!(ack.plan_status, Some(PlanStatus::Rejected));
    assert_eq!(audit.call_count(), 1);
    assert_eq!(invoice.call_count(), 0);

    let snapshot = harness.snapshot(plan_id).await;
    assert!(snapshot.context.cancel_requested);
    assert_eq!(snapshot.plan.terminal_reason.as_deref(), Some("cancelled"));
    let names = harness.event_names(plan_id).await;
    assert_eq!(names.last(), Some(&"plan_rejected"));
    assert!(!names.contains(&"plan_completed"));
}

/// Test: A blocked plan does not block another
/// Given one plan stuck inside a slow agent
/// When a second plan is approved
/// Then the second plan reaches its review while the first is still running
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocked_plan_is_isolated() {
    let release = Arc::new(Notify::new());
    let planning = ScriptedAgent::new("planning");
    let slow = ScriptedAgent::with_script(
        "slow",
        vec![Behavior::WaitFor(Arc::clone(&release), json!("slow done"))],
    );
    let invoice = ScriptedAgent::new("invoice");
    let provider = ScriptedSequenceProvider::new(vec![
        Ok(SequenceProposal::new(["planning", "slow"])),
        Ok(SequenceProposal::new(["planning", "invoice"])),
    ]);
    let harness = Arc::new(Harness::new(
        registry_with(&[&planning, &slow, &invoice]),
        provider,
        Arc::new(MemoryStore::new()),
        ExecutorConfig::fast(),
    ));

    let blocked = harness.submit("slow task").await.plan_id;
    let other = harness.submit("quick task").await.plan_id;

    let approving = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move { harness.approve(blocked).await })
    };
    tokio::time::timeout(Duration::from_secs(5), slow.started.notified())
        .await
        .expect("Slow agent never started");

    let ack = tokio::time::timeout(Duration::from_secs(5), harness.approve(other))
        .await
        .expect("Second plan was blocked");
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));
    assert_eq!(
        harness.snapshot(blocked).await.status(),
        PlanStatus::Running
    );

    release.notify_one();
    let ack = approving.await.expect("Approve task panicked");
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));
}
