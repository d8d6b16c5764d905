use std::future::Future;
use std::time::Duration;

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use rand::Rng;

use crate::config::StoreRetryConfig;
use crate::error::{LockError, Result, StoreError};

/// Exponential delay for the given 1-based attempt, capped, plus up to 50%
/// random jitter so racing clients spread out.
pub(crate) fn backoff_with_jitter(base: Duration, max: Duration, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let capped = base.saturating_mul(1u32 << exponent).min(max);
    let jitter_ceiling = (capped.as_millis() as u64) / 2;
    let jitter = if jitter_ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ceiling)
    };
    capped + Duration::from_millis(jitter)
}

pub(crate) struct ExponentialBackoffStrategy {
    operation: &'static str,
    max_attempts: usize,
    base: Duration,
    max: Duration,
}

impl ExponentialBackoffStrategy {
    pub(crate) fn new(operation: &'static str, config: &StoreRetryConfig) -> Self {
        Self {
            operation,
            max_attempts: config.max_attempts.max(1),
            base: config.base_delay(),
            max: config.max_delay(),
        }
    }
}

impl ErrorHandler<StoreError> for ExponentialBackoffStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts || !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        let delay = backoff_with_jitter(self.base, self.max, attempt);
        tracing::debug!(
            operation = self.operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "retrying store operation"
        );
        RetryPolicy::WaitRetry(delay)
    }
}

/// Runs a store round trip under the bounded retry policy.
///
/// Exhausting retries on an unavailable store yields
/// [`LockError::StoreUnavailable`]; non-retryable faults pass straight through
/// as [`LockError::Store`].
pub(crate) async fn with_store_retry<T, F, Fut>(
    config: &StoreRetryConfig,
    operation: &'static str,
    factory: F,
) -> Result<T>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = std::result::Result<T, StoreError>>,
{
    let strategy = ExponentialBackoffStrategy::new(operation, config);
    match FutureRetry::new(factory, strategy).await {
        Ok((value, _attempts)) => Ok(value),
        Err((e, attempts)) if e.is_retryable() => {
            tracing::warn!(operation, attempts, error = %e, "store unavailable, giving up");
            Err(LockError::StoreUnavailable {
                attempts,
                source: e,
            })
        }
        Err((e, _)) => Err(LockError::Store(e)),
    }
}
