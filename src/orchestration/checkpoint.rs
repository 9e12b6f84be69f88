//! Index of open checkpoints that may receive a human response.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::workflow::{PlanId, RequestId};

/// Maps the request id of every open checkpoint to its plan.
///
/// Filled when a checkpoint opens and on recovery; a response whose request
/// id is not here is stale. Closing is idempotent.
#[derive(Default)]
pub struct CheckpointRegistry {
    open: RwLock<HashMap<RequestId, PlanId>>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, request_id: RequestId, plan_id: PlanId) {
        self.open.write().await.insert(request_id, plan_id);
    }

    /// Returns whether the request was still open.
    pub async fn close(&self, request_id: RequestId) -> bool {
        self.open.write().await.remove(&request_id).is_some()
    }

    pub async fn matches(&self, request_id: RequestId, plan_id: PlanId) -> bool {
        self.open.read().await.get(&request_id) == Some(&plan_id)
    }
}
