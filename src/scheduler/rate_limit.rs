//! Global requests-per-minute budget shared by every session.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::gateway::ProviderError;

/// Token bucket with a burst allowance. The refill rate is trimmed by the
/// burst, so no 60 second window admits more than `rpm` requests even when
/// it opens on a full bucket.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Burst is a tenth of the per-minute rate, at least one request.
    pub fn per_minute(rpm: u32) -> Self {
        let burst = (rpm / 10).max(1);
        Self::with_burst(rpm, burst)
    }

    pub fn with_burst(rpm: u32, burst: u32) -> Self {
        let rpm = rpm.max(1);
        let burst = burst.clamp(1, rpm);
        let capacity = f64::from(burst);
        // A window holds at most `burst` stored tokens plus strictly less
        // than a minute of refill: burst + (rpm - burst + 1) - ε < rpm + 1.
        Self {
            capacity,
            refill_per_sec: f64::from(rpm - burst + 1) / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long until one is available.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Wait for a token. Gives up with a local rate-limit error when the
    /// next token is further away than `max_wait`.
    pub async fn acquire_within(&self, max_wait: Duration) -> Result<(), ProviderError> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_acquire().await {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(ProviderError::rate_limited_local(wait));
                    }
                    sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_steady_rate() {
        let limiter = RateLimiter::with_burst(60, 2);
        assert!(limiter.try_acquire().await.is_ok());
        assert!(limiter.try_acquire().await.is_ok());
        let wait = limiter.try_acquire().await.unwrap_err();
        // 59 tokens per minute after a burst of two.
        assert!(wait > Duration::from_secs(1) && wait < Duration::from_millis(1_100));

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(limiter.try_acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_within_waits_or_gives_up() {
        let limiter = RateLimiter::with_burst(60, 1);
        limiter.acquire_within(Duration::ZERO).await.unwrap();

        let err = limiter.acquire_within(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.code(), "rate_limited_local");

        let start = Instant::now();
        limiter.acquire_within(Duration::from_secs(5)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn first_minute_never_exceeds_rpm() {
        let limiter = RateLimiter::per_minute(60);
        let start = Instant::now();
        let mut admitted = 0;
        loop {
            limiter.acquire_within(Duration::from_secs(5)).await.unwrap();
            if start.elapsed() >= Duration::from_secs(60) {
                break;
            }
            admitted += 1;
        }
        assert!(admitted <= 60, "admitted {admitted} in the first minute");
        assert!(admitted >= 55);
    }

    #[test]
    fn burst_is_clamped_to_rpm() {
        let limiter = RateLimiter::with_burst(1, 10);
        assert_eq!(limiter.capacity, 1.0);
        assert!((limiter.refill_per_sec - 1.0 / 60.0).abs() < 1e-9);
    }
}
