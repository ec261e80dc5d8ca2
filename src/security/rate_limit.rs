//! Per-token rate limiting.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use super::token_bucket::{Clock, Rate, TokenBucket};
use crate::error::Result;

/// Upper bound on distinct tokens tracked at once.
pub const MAX_TRACKED_TOKENS: usize = 65_536;

struct Slot {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// A token bucket per distinct token, created lazily.
///
/// Buckets idle for longer than ten rate periods are dropped and recreated
/// full on next use. The least recently used bucket is evicted when the
/// cache is full.
pub struct TokenLimiter {
    rate: Rate,
    burst: u64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    buckets: Mutex<LruCache<String, Slot>>,
}

impl std::fmt::Debug for TokenLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLimiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}

impl TokenLimiter {
    pub fn new(rate: Rate, burst: u64, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(rate, burst, clock, MAX_TRACKED_TOKENS)
    }

    pub fn with_capacity(rate: Rate, burst: u64, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            rate,
            burst: burst.max(1),
            ttl: rate.period.saturating_mul(10),
            clock,
            buckets: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Charge `amount` to `token`. Zero means admitted.
    pub fn consume(&self, token: &str, amount: u64) -> Result<Duration> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");

        let expired = buckets
            .peek(token)
            .map(|slot| now.saturating_duration_since(slot.last_seen) > self.ttl)
            .unwrap_or(true);
        if expired {
            let bucket = TokenBucket::new(self.rate, self.burst, Arc::clone(&self.clock));
            buckets.put(token.to_string(), Slot { bucket, last_seen: now });
        }

        match buckets.get_mut(token) {
            Some(slot) => {
                slot.last_seen = now;
                slot.bucket.consume(amount)
            }
            None => Ok(Duration::ZERO),
        }
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().expect("rate limiter mutex poisoned").len()
    }
}
