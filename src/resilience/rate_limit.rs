//! Per-biz retry rate limiting.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

/// A simple token bucket; capacity equals the per-second rate.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Retry budget of every biz.
#[derive(Debug, Default)]
pub struct RetryRateLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl RetryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one retry token for `biz`; a rate of 0 forbids retries.
    pub fn try_acquire(&self, biz: &str, per_second: u64) -> bool {
        self.try_acquire_at(biz, per_second, Instant::now())
    }

    pub fn try_acquire_at(&self, biz: &str, per_second: u64, now: Instant) -> bool {
        if per_second == 0 {
            return false;
        }
        let rate = per_second as f64;
        if let Some(bucket) = self.buckets.get(biz) {
            return bucket.lock().try_acquire(rate, rate, now);
        }
        let bucket = self
            .buckets
            .entry(biz.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(rate, now)));
        let acquired = bucket.lock().try_acquire(rate, rate, now);
        acquired
    }
}
