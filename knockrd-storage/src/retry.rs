//! Bounded exponential backoff for startup provisioning.
//!
//! Steady-state reads and writes are never retried here; a failed
//! `get`/`set`/`delete` surfaces to the caller immediately.

use std::future::Future;

use knockrd_core::{RetryPolicy, StoreError};

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted,
/// sleeping `policy.delay_for_attempt(n)` between attempts.
///
/// Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!(
                        operation = operation,
                        attempts = attempt,
                        error = %e,
                        "Giving up after exhausting retries"
                    );
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
