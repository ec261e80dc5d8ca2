//! Token bucket with an injectable time source.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ProxyError, Result};

/// Time source for limiters.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

/// `units` tokens per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub units: u64,
    pub period: Duration,
}

impl Rate {
    pub fn new(units: u64, period: Duration) -> Result<Self> {
        if units == 0 {
            return Err(ProxyError::InvalidFormat("rate units must be positive".into()));
        }
        if period.is_zero() {
            return Err(ProxyError::InvalidFormat("rate period must be positive".into()));
        }
        Ok(Self { units, period })
    }

    /// Time to produce a single token.
    pub fn refill_period(&self) -> Duration {
        let nanos = self.period.as_nanos() / u128::from(self.units);
        Duration::from_nanos(u64::try_from(nanos.max(1)).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    refill_period: Duration,
    max_tokens: u64,
    tokens: u64,
    last_refill: Instant,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// A full bucket holding at most `max_tokens`.
    pub fn new(rate: Rate, max_tokens: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            refill_period: rate.refill_period(),
            max_tokens,
            tokens: max_tokens,
            last_refill: clock.now(),
            clock,
        }
    }

    /// Take `n` tokens.
    ///
    /// Returns zero when the tokens were taken, otherwise the time until
    /// enough tokens will be available (nothing is taken in that case).
    /// Asking for more than the bucket can ever hold is an error.
    pub fn consume(&mut self, n: u64) -> Result<Duration> {
        self.refill();
        if n > self.max_tokens {
            return Err(ProxyError::TokensExceedBurst {
                requested: n,
                max: self.max_tokens,
            });
        }
        if self.tokens < n {
            let missing = u128::from(n - self.tokens);
            let nanos = missing * self.refill_period.as_nanos();
            return Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)));
        }
        self.tokens -= n;
        Ok(Duration::ZERO)
    }

    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    // last_refill only moves when a whole token was added, so frequent calls
    // do not lose partial progress.
    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = elapsed.as_nanos() / self.refill_period.as_nanos();
        if added == 0 {
            return;
        }
        let added = u64::try_from(added).unwrap_or(u64::MAX);
        self.tokens = self.tokens.saturating_add(added).min(self.max_tokens);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(units: u64, period: Duration, max: u64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let rate = Rate::new(units, period).unwrap();
        (TokenBucket::new(rate, max, clock.clone()), clock)
    }

    #[test]
    fn one_per_second() {
        let (mut b, clock) = bucket(1, Duration::from_secs(1), 1);
        assert_eq!(b.consume(1).unwrap(), Duration::ZERO);
        assert_eq!(b.consume(1).unwrap(), Duration::from_secs(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(b.consume(1).unwrap(), Duration::ZERO);
    }

    #[test]
    fn waiting_does_not_deduct() {
        let (mut b, clock) = bucket(1, Duration::from_secs(1), 1);
        b.consume(1).unwrap();
        for _ in 0..5 {
            assert_eq!(b.consume(1).unwrap(), Duration::from_secs(1));
        }
        clock.advance(Duration::from_secs(1));
        assert_eq!(b.consume(1).unwrap(), Duration::ZERO);
    }

    #[test]
    fn burst_and_partial_wait() {
        let (mut b, clock) = bucket(10, Duration::from_secs(1), 3);
        assert_eq!(b.consume(3).unwrap(), Duration::ZERO);
        assert_eq!(b.consume(2).unwrap(), Duration::from_millis(200));
        clock.advance(Duration::from_millis(100));
        assert_eq!(b.consume(2).unwrap(), Duration::from_millis(100));
        clock.advance(Duration::from_millis(100));
        assert_eq!(b.consume(2).unwrap(), Duration::ZERO);
    }

    #[test]
    fn refill_is_capped() {
        let (mut b, clock) = bucket(1, Duration::from_secs(1), 2);
        b.consume(2).unwrap();
        clock.advance(Duration::from_secs(100));
        assert_eq!(b.available(), 2);
    }

    #[test]
    fn fractional_progress_is_kept() {
        let (mut b, clock) = bucket(1, Duration::from_secs(1), 1);
        b.consume(1).unwrap();
        for _ in 0..4 {
            clock.advance(Duration::from_millis(250));
            b.available();
        }
        assert_eq!(b.consume(1).unwrap(), Duration::ZERO);
    }

    #[test]
    fn more_than_burst_is_an_error() {
        let (mut b, _) = bucket(1, Duration::from_secs(1), 2);
        assert!(matches!(
            b.consume(3),
            Err(ProxyError::TokensExceedBurst { requested: 3, max: 2 })
        ));
    }

    #[test]
    fn invalid_rate() {
        assert!(Rate::new(0, Duration::from_secs(1)).is_err());
        assert!(Rate::new(1, Duration::ZERO).is_err());
    }
}
