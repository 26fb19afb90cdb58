//! Retry policy for opening the upstream call. Only connection-open failures
//! are retried; once the body is streaming, a replay would duplicate the
//! draft-message lifecycle, so mid-stream failures always surface.

use crate::classifier;
use crate::types::Result;
use std::future::Future;
use std::time::Duration;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e)
                    if attempts < self.max_attempts
                        && classifier::classify(Some(&e.inner)).retryable =>
                {
                    let base_delay = self.base_delay_ms * 2u64.pow(attempts - 1);
                    // ±25% jitter keeps concurrent retries from aligning.
                    let jitter_range = base_delay / 4;
                    let jitter = if jitter_range > 0 {
                        fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
                    } else {
                        0
                    };
                    let final_delay_ms = (base_delay as i64 + jitter).max(1) as u64;
                    let delay = Duration::from_millis(final_delay_ms);

                    tracing::warn!(
                        "Upstream open failed (attempt {}): {}. Retrying in {:?}...",
                        attempts,
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
