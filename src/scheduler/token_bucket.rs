//! Token bucket: refills continuously at `rate = capacity / window`,
//! checked under a small critical section, never held across I/O.
//!
//! Grounded on `middleware/rate_limit.rs`'s per-key `Arc<Mutex<...>>` +
//! window-reset shape, generalized from a fixed-window counter to a
//! continuous token bucket so partial windows don't cause bursty cliffs.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let refill_per_sec = capacity as f64 / window.as_secs_f64().max(0.001);
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempts to take one token. Returns `false` if the budget is
    /// currently exhausted — the caller should skip this attempt rather
    /// than block; an exhausted budget is not an error, it counts toward
    /// fallback.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn exhausts_then_refills() {
        let bucket = TokenBucket::new(2, Duration::from_millis(100));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        sleep(Duration::from_millis(120));
        assert!(bucket.try_acquire());
    }
}
