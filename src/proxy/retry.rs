//! Retry with exponential backoff.
//!
//! Upstream failures are classified transient (network, timeout, 5xx) or
//! permanent (4xx, validation). Only transient failures are retried, with
//! `base × 2^attempt` delays capped at a ceiling plus a small jitter so
//! synchronized clients do not stampede a recovering upstream.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::ProxySettings;
use crate::error::{DepotError, Result};

/// Failure classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// An upstream failure carrying its classification.
#[derive(Debug)]
pub struct FetchFailure {
    pub class: ErrorClass,
    pub error: DepotError,
}

impl FetchFailure {
    pub fn transient(error: DepotError) -> Self {
        Self {
            class: ErrorClass::Transient,
            error,
        }
    }

    pub fn permanent(error: DepotError) -> Self {
        Self {
            class: ErrorClass::Permanent,
            error,
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            max_attempts: settings.retry_attempts.max(1),
            base_delay: settings.retry_base_delay,
            max_delay: settings.retry_max_delay,
        }
    }

    /// Delay before retrying `attempt` (0-based), capped and jittered.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_cap = (exp.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        exp + Duration::from_millis(jitter)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchFailure>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let retryable = failure.class == ErrorClass::Transient
                        && attempt + 1 < self.max_attempts;
                    if !retryable {
                        return Err(failure.error);
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "transient upstream failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<u32> = policy()
            .run(move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FetchFailure::transient(DepotError::UpstreamFailure(
                            "flaky".into(),
                        )))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_short_circuit() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<u32> = policy()
            .run(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FetchFailure::permanent(DepotError::NotFound("gone".into())))
                }
            })
            .await;
        assert!(matches!(result, Err(DepotError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<u32> = policy()
            .run(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FetchFailure::transient(DepotError::UpstreamFailure(
                        "down".into(),
                    )))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert!(p.backoff_delay(0) >= Duration::from_millis(100));
        assert!(p.backoff_delay(1) >= Duration::from_millis(200));
        // Capped at max_delay plus at most 25% jitter.
        assert!(p.backoff_delay(10) <= Duration::from_millis(1250));
    }
}
