//! Broker-call budget enforcement
//!
//! Token bucket sized in calls per minute. Every broker request acquires a
//! token first and blocks while the bucket is empty, so a service can never
//! exceed its slice of the global 200/min API budget. Tokens refill
//! continuously rather than in whole-minute steps, which allows a small
//! burst but keeps any 60-second window under the configured rate.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Maximum tokens the bucket may hold at rest (burst allowance)
const BURST_CAP: f64 = 10.0;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter, shareable across tasks via `Clone`
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
    calls_per_minute: u32,
}

impl RateLimiter {
    /// Create a limiter allowing `calls_per_minute` sustained calls
    pub fn per_minute(calls_per_minute: u32) -> Self {
        let burst = BURST_CAP.min(calls_per_minute as f64);
        Self {
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            })),
            calls_per_minute,
        }
    }

    pub fn calls_per_minute(&self) -> u32 {
        self.calls_per_minute
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.calls_per_minute as f64 / 60.0
    }

    fn burst_cap(&self) -> f64 {
        BURST_CAP.min(self.calls_per_minute as f64)
    }

    /// Acquire one call token, waiting for the bucket to refill if empty
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                // Time until one full token accrues
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_rate_per_sec())
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is available right now
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (floored)
    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens as u32
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate_per_sec()).min(self.burst_cap());
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_burst() {
        let limiter = RateLimiter::per_minute(200);
        assert_eq!(limiter.available().await, 10);
    }

    #[tokio::test]
    async fn test_burst_capped_by_rate() {
        let limiter = RateLimiter::per_minute(5);
        assert_eq!(limiter.available().await, 5);
    }

    #[tokio::test]
    async fn test_acquire_consumes_tokens() {
        let limiter = RateLimiter::per_minute(200);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.available().await, 0);
    }

    #[tokio::test]
    async fn test_try_acquire_exhausted() {
        let limiter = RateLimiter::per_minute(60);
        for _ in 0..10 {
            assert!(limiter.try_acquire().await);
        }
        // Bucket drained; sustained rate is 1/s so no token yet
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        tokio::time::pause();

        let limiter = RateLimiter::per_minute(60);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(!limiter.try_acquire().await);

        // 1 call/sec sustained: after 2 virtual seconds, two tokens are back
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_refill() {
        tokio::time::pause();

        let limiter = RateLimiter::per_minute(60);
        for _ in 0..10 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        // Auto-advanced virtual time should be about one refill interval
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_clone_shares_bucket() {
        let a = RateLimiter::per_minute(200);
        let b = a.clone();

        for _ in 0..10 {
            a.acquire().await;
        }
        assert!(!b.try_acquire().await);
    }
}
