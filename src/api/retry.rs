// src/api/retry.rs
//! Bounded retry with exponential backoff, symmetric jitter and rate-limit reset waits

use log::{debug, error, info, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use super::error_handling::{ApiFailure, Classifier, RetryDecision};
use crate::config::ServiceConfig;

pub const BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry knobs captured from a service config at dispatch time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry_attempts: u32,
    pub backoff_multiplier: f64,
    pub jitter_range: f64,
}

impl From<&ServiceConfig> for RetryPolicy {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            backoff_multiplier: config.backoff_multiplier,
            jitter_range: config.jitter_range,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry_count + 1`, with a fresh jitter sample
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        self.backoff_delay_with(retry_count, sample)
    }

    /// `min(multiplier^retry_count * 1s * (1 + (sample - 0.5) * jitter_range), 60s)`
    pub fn backoff_delay_with(&self, retry_count: u32, sample: f64) -> Duration {
        let jitter_factor = 1.0 + (sample - 0.5) * self.jitter_range;
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay_ms = self.backoff_multiplier.powi(exponent)
            * BASE_BACKOFF.as_millis() as f64
            * jitter_factor;
        let capped_ms = delay_ms.clamp(0.0, MAX_BACKOFF.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// Everything a dispatched request needs to run its attempts
#[derive(Clone)]
pub struct RetryContext {
    pub service: String,
    pub policy: RetryPolicy,
    pub classifier: Classifier,
}

/// Runs `operation` until it succeeds, fails fatally, or exhausts the retry budget.
/// The error returned is always the last failure the operation produced.
pub async fn run_with_retry<T, F, Fut>(
    ctx: &RetryContext,
    id: &str,
    operation: &mut F,
) -> Result<T, ApiFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiFailure>>,
{
    let mut retry_count: u32 = 0;

    loop {
        let failure = match operation().await {
            Ok(value) => {
                if retry_count > 0 {
                    info!(
                        "✅ {} request {} succeeded after {} retries",
                        ctx.service, id, retry_count
                    );
                }
                return Ok(value);
            }
            Err(failure) => failure,
        };

        let reset_wait = match (ctx.classifier)(&failure) {
            RetryDecision::Fatal => {
                warn!(
                    "🚫 {} request {} failed with non-retryable error: {}",
                    ctx.service, id, failure
                );
                return Err(failure);
            }
            RetryDecision::Retryable => None,
            RetryDecision::RetryableWithExtraDelay(wait) => Some(wait),
        };

        if retry_count >= ctx.policy.retry_attempts {
            error!(
                "❌ {} request {} failed after {} attempts: {}",
                ctx.service,
                id,
                retry_count + 1,
                failure
            );
            return Err(failure);
        }

        let delay = ctx.policy.backoff_delay(retry_count);
        retry_count += 1;
        warn!(
            "🔄 {} request {} attempt {}/{} failed: {} (retrying in {:?})",
            ctx.service,
            id,
            retry_count,
            ctx.policy.retry_attempts + 1,
            failure,
            delay
        );
        sleep(delay).await;

        if let Some(wait) = reset_wait {
            debug!(
                "⏳ {} request {} waiting {:?} for rate limit reset",
                ctx.service, id, wait
            );
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error_handling::{classifier, http_status_classifier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn ctx(retry_attempts: u32) -> RetryContext {
        RetryContext {
            service: "test".to_string(),
            policy: RetryPolicy {
                retry_attempts,
                backoff_multiplier: 2.0,
                jitter_range: 0.2,
            },
            classifier: http_status_classifier(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            retry_attempts: 10,
            backoff_multiplier: 2.0,
            jitter_range: 0.0,
        };
        assert_eq!(policy.backoff_delay_with(0, 0.9), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay_with(1, 0.1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay_with(3, 0.5), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay_with(10, 0.5), MAX_BACKOFF);
        assert_eq!(policy.backoff_delay_with(u32::MAX, 0.5), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_is_symmetric_band() {
        let policy = RetryPolicy {
            retry_attempts: 3,
            backoff_multiplier: 1.5,
            jitter_range: 0.2,
        };
        // 1.5^2 * 1000 = 2250ms, band is +-10%
        assert_eq!(policy.backoff_delay_with(2, 0.0), Duration::from_millis(2025));
        assert_eq!(policy.backoff_delay_with(2, 0.5), Duration::from_millis(2250));
        assert_eq!(policy.backoff_delay_with(2, 1.0), Duration::from_millis(2475));

        for _ in 0..200 {
            let delay = policy.backoff_delay(2);
            assert!(delay >= Duration::from_millis(2025) && delay <= Duration::from_millis(2475));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiFailure::network("connection reset"))
                } else {
                    Ok("done")
                }
            }
        };

        let result = run_with_retry(&ctx(5), "req", &mut op).await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut op = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiFailure::status(500, "boom")) }
        };

        let result = run_with_retry(&ctx(3), "req", &mut op).await;
        assert_eq!(result, Err(ApiFailure::status(500, "boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_skips_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut op = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiFailure::status(401, "bad key")) }
        };

        let start = Instant::now();
        let result = run_with_retry(&ctx(7), "req", &mut op).await;
        assert_eq!(result.unwrap_err().status_code(), Some(401));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_delay_is_added_to_backoff() {
        let mut ctx = ctx(2);
        ctx.policy.jitter_range = 0.0;
        ctx.classifier =
            classifier(|_| RetryDecision::RetryableWithExtraDelay(Duration::from_secs(5)));

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiFailure::status(503, "busy"))
                } else {
                    Ok(n)
                }
            }
        };

        let start = Instant::now();
        assert_eq!(run_with_retry(&ctx, "req", &mut op).await, Ok(1));
        // 1s backoff + 5s reset wait
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_millis(6_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retry_budget_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut op = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ApiFailure::network("down")) }
        };

        assert!(run_with_retry(&ctx(0), "req", &mut op).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
