use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff policy for idempotent portal calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): doubled each time,
    /// capped, plus random jitter.
    fn delay_before(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let backoff = self
            .base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff));

        let jitter = self
            .jitter_max
            .map(|max| max.as_millis() as u64)
            .filter(|ms| *ms > 0)
            .map_or(0, |ms| rand::rng().random_range(0..=ms));
        backoff + Duration::from_millis(jitter)
    }
}

/// Runs `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the attempts run out.
pub async fn retry_async_if<Op, Fut, T, E, P>(
    config: &RetryConfig,
    should_retry: P,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut retry = 0u32;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        retry += 1;
        if retry as usize >= attempts || !should_retry(&err) {
            return Err(err);
        }

        let delay = config.delay_before(retry);
        tracing::debug!(
            "Attempt {} of {} failed ({}), retrying in {:?}",
            retry,
            attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
