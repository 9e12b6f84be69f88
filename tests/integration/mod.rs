//! Integration test suite for agentflow.
//!
//! These tests drive the workflow executor end to end with scripted agents
//! and verify checkpoints, revision loops, recovery and event ordering.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full plan execution and event streams
//! - `revision_loop`: Repeated revisions of one step
//! - `recovery`: Restart, re-registration and duplicate responses
//! - `failures`: Timeouts, agent errors, persistence and sequencing failures
//! - `concurrency`: Many plans at once and cancellation mid-step
//!
//! No test talks to a real agent backend; every agent is scripted.


mod concurrency;
mod revision_loop;
mod workflow_e2e;
