//! Durable plan state.
//!
//! The executor persists an [`crate::workflow::Snapshot`] after every
//! transition through the [`DurableStore`] trait so a plan suspended on a
//! checkpoint survives a process restart.

mod store;

pub use store::{DurableStore, FileStore, MemoryStore, PlanSummary};
