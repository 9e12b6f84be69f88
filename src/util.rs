//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run filesystem work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Exponential backoff before retry number `retry` (1-based), capped at `max`.
pub fn backoff_delay(base: Duration, retry: u32, max: Duration) -> Duration {
    let shift = retry.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}
