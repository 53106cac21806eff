//! Bounded retry for transient external operations
//!
//! Wraps any fallible async operation with a maximum attempt count and a
//! backoff schedule. Used by the media fetcher; reusable for any transient
//! I/O call.

use std::future::Future;
use std::time::Duration;

/// Linear backoff: `attempt * step`
#[must_use]
pub fn linear(step: Duration) -> impl Fn(u32) -> Duration {
    move |attempt| step * attempt
}

/// Run `op` up to `max_attempts` times, sleeping `backoff(attempt)` after
/// each failure. Attempts are numbered from 1.
///
/// Returns the first success, or the last error once attempts are exhausted.
///
/// # Errors
///
/// Returns the final attempt's error when all attempts fail.
pub async fn with_backoff<T, E, F, Fut, B>(
    max_attempts: u32,
    backoff: B,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    B: Fn(u32) -> Duration,
    E: std::fmt::Display,
{
    debug_assert!(max_attempts > 0);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
