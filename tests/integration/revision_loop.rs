//! Revision loop tests.
//!
//! A revised step is re-invoked in place: the step index does not move, the
//! earlier result stays in history and the agent sees the reviewer's note.

use serde_json::json;

use agentflow::workflow::{PlanStatus, TranscriptEntry};
use agentflow::ExecutorConfig;

use crate::fixtures::{registry_with, reply, Harness, ScriptedAgent};

/// Test: One revision of the invoice step
/// Given the invoice agent returned R1
/// When the reviewer asks to add the vendor name and then approves R2
/// Then the plan completes with both results recorded
#[tokio::test]
async fn test_single_revision_round() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::with_script(
        "invoice",
        vec![reply("R1: total 100"), reply("R2: total 100, vendor ACME")],
    );
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice INV-1").await;
    harness.approve(receipt.plan_id).await;

    let ack = harness.revise(receipt.plan_id, "add vendor name").await;
    assert_eq!(ack.plan_status, Some(PlanStatus::AwaitingRevision));
    let request = harness
        .executor
        .pending_request(receipt.plan_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        request.presented_payload["result_message"],
        json!("R2: total 100, vendor ACME")
    );
    assert_eq!(request.presented_payload["iteration"], json!(2));

    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::Completed));

    let snapshot = harness.snapshot(receipt.plan_id).await;
    let context = &snapshot.context;
    assert_eq!(context.history.len(), 3);
    assert_eq!(context.revision_count, 1);
    assert_eq!(context.history[1].result_message, json!("R1: total 100"));
    assert_eq!(
        context.history[2].result_message,
        json!("R2: total 100, vendor ACME")
    );
    assert_eq!(context.history[2].iteration, 2);

    let calls = invoice.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].feedback, None);
    assert!(calls[0].previous_results.is_empty());
    assert_eq!(calls[1].iteration, 2);
    assert_eq!(calls[1].feedback.as_deref(), Some("add vendor name"));
    assert_eq!(calls[1].previous_results, vec![json!("R1: total 100")]);
}

/// Test: k revisions invoke the agent k + 1 times
/// Given 0, 1 and 3 revision rounds on the same step
/// When each round is answered with revise
/// Then iterations count up and the step index never advances
#[tokio::test]
async fn test_revision_rounds_keep_step_index() {
    for rounds in [0u32, 1, 3] {
        let planning = ScriptedAgent::new("planning");
        let invoice = ScriptedAgent::new("invoice");
        let vendor = ScriptedAgent::new("vendor");
        let harness = Harness::with_sequence(
            registry_with(&[&planning, &invoice, &vendor]),
            &["planning", "invoice", "vendor"],
            ExecutorConfig::fast(),
        );

        let receipt = harness.submit("check invoice").await;
        harness.approve(receipt.plan_id).await;
        for round in 0..rounds {
            harness
                .revise(receipt.plan_id, &format!("round {}", round + 1))
                .await;
            let snapshot = harness.snapshot(receipt.plan_id).await;
            assert_eq!(snapshot.context.current_step_index, 1);
            assert_eq!(snapshot.status(), PlanStatus::AwaitingRevision);
        }

        let iterations: Vec<u32> = invoice.calls().iter().map(|c| c.iteration).collect();
        let expected: Vec<u32> = (1..=rounds + 1).collect();
        assert_eq!(iterations, expected, "rounds = {rounds}");
        assert_eq!(vendor.call_count(), 0);

        harness.approve(receipt.plan_id).await;
        assert_eq!(vendor.call_count(), 1);
        let snapshot = harness.snapshot(receipt.plan_id).await;
        assert_eq!(snapshot.context.current_step_index, 2);
        assert_eq!(snapshot.context.revision_count, rounds);
        assert_eq!(
            snapshot.context.records_for(1).count() as u32,
            rounds + 1
        );
    }
}

/// Test: Transcript interleaves results and notes
/// Given a revised invoice step
/// When the transcript is read
/// Then the note sits between the two results it separates
#[tokio::test]
async fn test_transcript_order() {
    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice").await;
    harness.approve(receipt.plan_id).await;
    harness.revise(receipt.plan_id, "use net totals").await;

    let snapshot = harness.snapshot(receipt.plan_id).await;
    let transcript: Vec<String> = snapshot
        .context
        .transcript()
        .into_iter()
        .map(|entry| match entry {
            TranscriptEntry::Record(record) => {
                record.result_message.as_str().unwrap_or_default().to_string()
            }
            TranscriptEntry::Revision(revision) => format!("note: {}", revision.text),
        })
        .collect();
    assert_eq!(
        transcript,
        vec![
            "planning v1",
            "invoice v1",
            "note: use net totals",
            "invoice v2"
        ]
    );
}

/// Test: Long revision loops stay bounded
/// Given a reviewer that revises the same step a hundred times
/// When the loop finally gets approved
/// Then every iteration is recorded and the plan completes
#[tokio::test]
async fn test_deep_revision_loop() {
    const ROUNDS: u32 = 100;

    let planning = ScriptedAgent::new("planning");
    let invoice = ScriptedAgent::new("invoice");
    let harness = Harness::with_sequence(
        registry_with(&[&planning, &invoice]),
        &["planning", "invoice"],
        ExecutorConfig::fast(),
    );

    let receipt = harness.submit("check invoice").await;
    harness.approve(receipt.plan_id).await;
    for round in 0..ROUNDS {
        harness.revise(receipt.plan_id, &format!("try {round}")).await;
    }
    let ack = harness.approve(receipt.plan_id).await;
    assert_eq!(ack.plan_status, Some(PlanStatus::Completed));

    let snapshot = harness.snapshot(receipt.plan_id).await;
    assert_eq!(snapshot.context.revision_count, ROUNDS);
    assert_eq!(snapshot.context.history.len() as u32, ROUNDS + 2);
    assert_eq!(
        snapshot.context.history.last().unwrap().result_message,
        json!(format!("invoice v{}", ROUNDS + 1))
    );
    assert_eq!(invoice.call_count() as u32, ROUNDS + 1);
}
