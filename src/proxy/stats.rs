//! Round-trip statistics for frontends and upstream servers.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;

/// How a proxied round trip ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Status(StatusCode),
    /// No response: connect failure, reset, timeout.
    NetworkError,
}

/// Lock-free counters updated on every round trip.
#[derive(Debug, Default)]
pub struct RoundTripCounters {
    requests: AtomicU64,
    network_errors: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    latency_total_us: AtomicU64,
}

impl RoundTripCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome, latency: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_total_us.fetch_add(micros, Ordering::Relaxed);
        let bucket = match outcome {
            Outcome::NetworkError => &self.network_errors,
            Outcome::Status(s) if s.is_server_error() => &self.status_5xx,
            Outcome::Status(s) if s.is_client_error() => &self.status_4xx,
            Outcome::Status(s) if s.is_redirection() => &self.status_3xx,
            Outcome::Status(_) => &self.status_2xx,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RoundTripStats {
        RoundTripStats {
            requests: self.requests.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            status_2xx: self.status_2xx.load(Ordering::Relaxed),
            status_3xx: self.status_3xx.load(Ordering::Relaxed),
            status_4xx: self.status_4xx.load(Ordering::Relaxed),
            status_5xx: self.status_5xx.load(Ordering::Relaxed),
            latency_total_us: self.latency_total_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `RoundTripCounters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundTripStats {
    pub requests: u64,
    pub network_errors: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub latency_total_us: u64,
}

impl RoundTripStats {
    /// Server errors plus network errors.
    pub fn failures(&self) -> u64 {
        self.status_5xx + self.network_errors
    }

    pub fn failure_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.failures() as f64 / self.requests as f64
    }

    pub fn mean_latency(&self) -> Duration {
        if self.requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_total_us / self.requests)
    }

    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &RoundTripStats) {
        self.requests += other.requests;
        self.network_errors += other.network_errors;
        self.status_2xx += other.status_2xx;
        self.status_3xx += other.status_3xx;
        self.status_4xx += other.status_4xx;
        self.status_5xx += other.status_5xx;
        self.latency_total_us += other.latency_total_us;
    }
}

/// Worst first: higher failure rate, then higher mean latency, then more
/// requests.
pub fn rank<T>(items: &mut [(T, RoundTripStats)]) {
    items.sort_by(|(_, a), (_, b)| {
        b.failure_rate()
            .partial_cmp(&a.failure_rate())
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| b.mean_latency().cmp(&a.mean_latency()))
            .then_with(|| b.requests.cmp(&a.requests))
    });
}
