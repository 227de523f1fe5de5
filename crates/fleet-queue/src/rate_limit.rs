//! Requeue rate limiting: per-key exponential backoff combined with a
//! queue-wide token bucket, whichever asks for the longer wait.

use std::collections::HashMap;
use std::time::Duration;

use fleet_common::ObjectKey;
use tokio::time::Instant;

/// Default first retry delay for a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default ceiling for the per-key backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Default token refill rate (requeues per second)
pub const DEFAULT_QPS: f64 = 10.0;
/// Default token bucket size
pub const DEFAULT_BURST: u32 = 100;

/// Queue-wide token bucket
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: burst as f64,
            tokens: burst as f64,
            last: Instant::now(),
        }
    }

    /// Reserve one token and return how long the caller must wait for it
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 || self.rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// Combined exponential + token bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: HashMap<ObjectKey, u32>,
    bucket: TokenBucket,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl RateLimiter {
    /// Create a limiter with explicit bounds
    pub fn new(base_delay: Duration, max_delay: Duration, qps: f64, burst: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: HashMap::new(),
            bucket: TokenBucket::new(qps, burst),
        }
    }

    /// Delay before `key` may be retried; each call counts as one failure
    pub fn when(&mut self, key: &ObjectKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = 2f64.powi((*failures).min(62) as i32);
        *failures += 1;
        let backoff = Duration::from_secs_f64(
            (self.base_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64()),
        );
        backoff.max(self.bucket.reserve())
    }

    /// Clear the failure history of `key`
    pub fn forget(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}
