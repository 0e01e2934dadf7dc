use crate::error::{BatonError, BatonResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// The single retry policy shared by the gateway, the governor and the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Fraction of each delay randomised, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential delay before retry number `attempt` (0-based), capped at
    /// `backoff_max_ms`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Delay with jitter applied. Never exceeds `backoff_max_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base == 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let ms = (base + offset).clamp(0.0, self.backoff_max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt ceiling is reached. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> BatonResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = BatonResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err: Option<BatonError> = None;

        for attempt in 0..attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt + 1 < attempts {
                        let delay = self.delay(attempt);
                        debug!(
                            op = %label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(op = %label, attempts, error = %e, "Retry ceiling reached");
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| BatonError::Agent(format!("{label}: no attempts made"))))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 1_100,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay(0).as_millis();
            assert!((500..=1_100).contains(&d), "{d}");
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("flaky", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BatonError::GatewayUnavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_stops_at_ceiling() {
        let calls = AtomicU32::new(0);
        let result: BatonResult<()> = fast_policy(4)
            .run("down", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BatonError::Http("connection refused".into()))
            })
            .await;
        assert!(matches!(result, Err(BatonError::Http(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_structural_errors() {
        let calls = AtomicU32::new(0);
        let result: BatonResult<()> = fast_policy(5)
            .run("structural", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BatonError::Protocol("bad schema".into()))
            })
            .await;
        assert!(matches!(result, Err(BatonError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
