//! Per-key request rate limiting.
//!
//! Every API key owns a token bucket holding up to `rate_limit` tokens that
//! refills at `rate_limit` tokens per minute. An inference request spends
//! one token; an empty bucket answers with the seconds until the next token.

use std::collections::HashMap;
use std::sync::Arc;

use infergrid_state::Clock;
use parking_lot::Mutex;

const WINDOW_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: u64,
}

pub struct KeyRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<dyn Clock>,
}

impl KeyRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Spend one token from `key_id`'s bucket. `Err` carries the whole
    /// seconds to wait before a retry can succeed.
    pub fn check(&self, key_id: &str, per_minute: u32) -> Result<(), u64> {
        let capacity = f64::from(per_minute.max(1));
        let now = self.clock.now();

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key_id.to_string()).or_insert(Bucket {
            tokens: capacity,
            refilled_at: now,
        });
        let elapsed = now.saturating_sub(bucket.refilled_at) as f64;
        bucket.tokens = (bucket.tokens + elapsed * capacity / WINDOW_SECS).min(capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = ((1.0 - bucket.tokens) * WINDOW_SECS / capacity).ceil() as u64;
            Err(wait.max(1))
        }
    }

    /// Drop a key's bucket, e.g. once the key is revoked.
    pub fn forget(&self, key_id: &str) {
        self.buckets.lock().remove(key_id);
    }
}
