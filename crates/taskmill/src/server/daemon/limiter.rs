use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use millstone::common::clock::Clock;

/// Token bucket limiting how many executors are started per second.
///
/// A non-positive rate disables limiting.
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: clock.now(),
            }),
            clock,
        }
    }

    /// Takes one permit if available, never waits.
    pub fn try_acquire(&self) -> bool {
        if self.rate_per_second <= 0.0 {
            return true;
        }
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();
        let elapsed = (now - bucket.last_refill).to_std().unwrap_or_default();
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_second).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
