use std::time::Duration;
use tokio::time::Instant;

/// Token bucket refilled continuously at `capacity / interval`.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket, or `None` when `max_requests` is zero (unlimited).
    pub(crate) fn new(max_requests: u32, interval: Duration) -> Option<Self> {
        if max_requests == 0 || interval.is_zero() {
            return None;
        }
        let capacity = f64::from(max_requests);
        Some(Self {
            capacity,
            refill_per_sec: capacity / interval.as_secs_f64(),
            tokens: capacity,
            last_refill: Instant::now(),
        })
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes a token, or returns how long until one is available.
    pub(crate) fn take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec).max(Duration::from_millis(1)))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_requests_means_unlimited() {
        assert!(TokenBucket::new(0, Duration::from_secs(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_drains_and_refills() {
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1)).unwrap();
        assert!(bucket.take().is_ok());
        assert!(bucket.take().is_ok());
        let wait = bucket.take().unwrap_err();
        assert!(wait <= Duration::from_millis(500), "{wait:?}");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.take().is_ok());
    }
}
