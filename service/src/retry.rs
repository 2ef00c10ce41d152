//! Retry policy for storage conflicts.
//!
//! Only errors whose [`LedgerError::is_retryable`] is true are retried, which
//! today means storage-detected conflicts. Business-rule failures such as
//! insufficient funds or a missing account are returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use ledgerflow_common::{LedgerError, Result};
use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(MAX_BACKOFF)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        if backoff.is_zero() {
            return backoff;
        }
        // Up to half of the backoff on top.
        let extra = rand::thread_rng().gen_range(0..=backoff.as_micros() as u64 / 2);
        backoff + Duration::from_micros(extra)
    }

    /// Run `op`, retrying retryable failures. `on_retry` sees each error that
    /// triggers a retry together with the retry number.
    pub async fn run<T, F, Fut>(&self, mut op: F, on_retry: impl Fn(&LedgerError, u32)) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    // Ordered locking leaves only storage-level anomalies here.
                    warn!(
                        retry,
                        max_retries = self.max_retries,
                        error = %err,
                        "Storage conflict, retrying transfer"
                    );
                    on_retry(&err, retry);
                    tokio::time::sleep(self.jittered(retry)).await;
                }
                outcome => return outcome,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            backoff_base: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let retries = AtomicU32::new(0);
        let counter = &attempts;

        let value = policy(2)
            .run(
                move || async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(LedgerError::Conflict("deadlock detected".into()))
                    } else {
                        Ok(7)
                    }
                },
                |_, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let err = policy(2)
            .run(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(LedgerError::Conflict("serialization failure".into()))
                },
                |_, _| {},
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        for err in [
            LedgerError::AccountNotFound("7".into()),
            LedgerError::SameAccount,
            LedgerError::Timeout("deadline".into()),
        ] {
            let attempts = AtomicU32::new(0);
            let returned = policy(2)
                .run(
                    || {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        let err = err.clone();
                        async move { Err::<(), _>(err) }
                    },
                    |_, _| {},
                )
                .await
                .unwrap_err();

            assert_eq!(returned.error_code(), err.error_code());
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(30), MAX_BACKOFF);
        assert_eq!(RetryPolicy::none().backoff(1), Duration::ZERO);
    }
}
