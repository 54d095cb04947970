use std::{future::Future, time::Duration};

use guardian_common::tokio::time::sleep;

use crate::config::{RETRY_BASE_DELAY_MILLIS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_SECS};

/// Capped exponential backoff schedule
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RETRY_BASE_DELAY_MILLIS),
            max: Duration::from_secs(RETRY_MAX_DELAY_SECS),
            attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Retry an operation on retryable errors, sleeping between attempts.
/// The final error is returned untouched once attempts are exhausted.
pub async fn retry<T, E, F, Fut, R>(
    backoff: Backoff,
    mut is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < backoff.attempts && is_retryable(&e) => {
                let delay = backoff.delay_for(attempt);
                debug!(
                    "retrying after error (attempt {}/{}, waiting {:?}): {}",
                    attempt + 1,
                    backoff.attempts,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
