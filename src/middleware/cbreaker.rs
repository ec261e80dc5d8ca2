//! `cbreaker` middleware: circuit breaker over the frontend's round trips.
//!
//! # States
//! ```text
//! Standby ──condition matches──▶ Tripped ──fallback_duration──▶ Recovering
//!    ▲                              ▲                               │
//!    │                              └──────condition matches────────┤
//!    └──────────────────────recovery_duration───────────────────────┘
//! ```
//!
//! - Standby: every request goes through and its outcome is recorded
//! - Tripped: every request gets the fallback, stats start over
//! - Recovering: a growing share of requests goes through, from none at
//!   the start of the period to all at its end; the rest get the fallback
//!
//! The condition is evaluated on completion at most once per
//! `check_period`. Requests answered by the fallback are never recorded.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::{Middleware, MiddlewareFactory};
use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::http::response::found;
use crate::observability::metrics;
use crate::proxy::stats::{Outcome, RoundTripCounters};
use crate::security::{Clock, SystemClock};

pub const KIND: &str = "cbreaker";

/// JSON settings of a `cbreaker` middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSpec {
    pub condition: String,
    #[serde(default)]
    pub fallback: FallbackSpec,
    #[serde(default = "default_fallback_duration")]
    pub fallback_duration_ms: u64,
    #[serde(default = "default_recovery_duration")]
    pub recovery_duration_ms: u64,
    #[serde(default = "default_check_period")]
    pub check_period_ms: u64,
}

fn default_fallback_duration() -> u64 {
    10_000
}

fn default_recovery_duration() -> u64 {
    10_000
}

fn default_check_period() -> u64 {
    100
}

/// What tripped requests get: a redirect when `redirect` is set, a canned
/// response otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSpec {
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub redirect: Option<String>,
}

impl Default for FallbackSpec {
    fn default() -> Self {
        Self {
            status: 503,
            content_type: "text/plain".to_string(),
            body: "service unavailable".to_string(),
            redirect: None,
        }
    }
}

#[derive(Debug)]
enum Fallback {
    Respond {
        status: StatusCode,
        content_type: HeaderValue,
        body: String,
    },
    Redirect(String),
}

impl Fallback {
    fn from_spec(spec: &FallbackSpec) -> Result<Self> {
        if let Some(location) = &spec.redirect {
            url::Url::parse(location).map_err(|e| {
                ProxyError::InvalidFormat(format!("fallback redirect '{}': {}", location, e))
            })?;
            return Ok(Fallback::Redirect(location.clone()));
        }
        let status = StatusCode::from_u16(spec.status)
            .map_err(|_| ProxyError::InvalidFormat(format!("fallback status {} is not valid", spec.status)))?;
        let content_type = HeaderValue::from_str(&spec.content_type).map_err(|_| {
            ProxyError::InvalidFormat(format!("fallback content type '{}' is not valid", spec.content_type))
        })?;
        Ok(Fallback::Respond {
            status,
            content_type,
            body: spec.body.clone(),
        })
    }

    fn response(&self) -> Response {
        match self {
            Fallback::Redirect(location) => found(location),
            Fallback::Respond {
                status,
                content_type,
                body,
            } => {
                let mut response = Response::new(Body::from(body.clone()));
                *response.status_mut() = *status;
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type.clone());
                response
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Standby,
    Tripped,
    Recovering,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Standby => "standby",
            BreakerState::Tripped => "tripped",
            BreakerState::Recovering => "recovering",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// End of the current tripped or recovering period.
    until: Instant,
    next_check: Instant,
    stats: RoundTripCounters,
    /// Requests let through and turned away since recovery started.
    allowed: u64,
    denied: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    spec: CircuitBreakerSpec,
    condition: Condition,
    fallback: Fallback,
    fallback_duration: Duration,
    recovery_duration: Duration,
    check_period: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn from_spec(spec: CircuitBreakerSpec, clock: Arc<dyn Clock>) -> Result<Self> {
        let condition = Condition::parse(&spec.condition)?;
        let fallback = Fallback::from_spec(&spec.fallback)?;
        let now = clock.now();
        Ok(Self {
            condition,
            fallback,
            fallback_duration: Duration::from_millis(spec.fallback_duration_ms),
            recovery_duration: Duration::from_millis(spec.recovery_duration_ms),
            check_period: Duration::from_millis(spec.check_period_ms),
            inner: Mutex::new(Inner {
                state: BreakerState::Standby,
                until: now,
                next_check: now,
                stats: RoundTripCounters::new(),
                allowed: 0,
                denied: 0,
            }),
            clock,
            spec,
        })
    }

    pub fn spec(&self) -> &CircuitBreakerSpec {
        &self.spec
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    fn set_state(&self, inner: &mut Inner, state: BreakerState, until: Instant) {
        tracing::info!(
            condition = %self.condition,
            from = %inner.state,
            to = %state,
            "Circuit breaker changed state"
        );
        inner.state = state;
        inner.until = until;
    }

    /// Share of requests let through at `now` while recovering.
    fn recovery_ratio(&self, inner: &Inner, now: Instant) -> f64 {
        if self.recovery_duration.is_zero() {
            return 1.0;
        }
        let started = inner.until.checked_sub(self.recovery_duration).unwrap_or(inner.until);
        let elapsed = now.saturating_duration_since(started);
        (elapsed.as_secs_f64() / self.recovery_duration.as_secs_f64()).min(1.0)
    }

    fn reject(&self, ctx: &RequestContext, state: BreakerState) -> Result<Option<Response>> {
        tracing::debug!(request_id = %ctx.request_id, state = %state, "Circuit breaker fallback");
        metrics::record_rejected("circuit_breaker");
        Ok(Some(self.fallback.response()))
    }
}

impl Middleware for CircuitBreaker {
    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Response>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Standby => Ok(None),
            BreakerState::Tripped => {
                if now >= inner.until {
                    self.set_state(&mut inner, BreakerState::Recovering, now + self.recovery_duration);
                    inner.allowed = 0;
                    inner.denied = 0;
                }
                self.reject(ctx, BreakerState::Tripped)
            }
            BreakerState::Recovering => {
                if now >= inner.until {
                    self.set_state(&mut inner, BreakerState::Standby, now);
                    return Ok(None);
                }
                let ratio = self.recovery_ratio(&inner, now);
                let total = inner.allowed + inner.denied + 1;
                if (inner.allowed as f64) < ratio * total as f64 {
                    inner.allowed += 1;
                    return Ok(None);
                }
                inner.denied += 1;
                self.reject(ctx, BreakerState::Recovering)
            }
        }
    }

    fn process_response(&self, ctx: &RequestContext, outcome: Option<Outcome>) {
        let Some(outcome) = outcome else {
            return;
        };
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.stats.record(outcome, ctx.received_at.elapsed());

        if now < inner.next_check {
            return;
        }
        inner.next_check = now + self.check_period;
        if inner.state == BreakerState::Tripped || !self.condition.matches(&inner.stats.snapshot()) {
            return;
        }
        tracing::warn!(
            frontend = %ctx.frontend_id,
            stats = ?inner.stats.snapshot(),
            "Circuit breaker tripped"
        );
        self.set_state(&mut inner, BreakerState::Tripped, now + self.fallback_duration);
        inner.stats = RoundTripCounters::new();
    }
}

pub struct CircuitBreakerFactory {
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for CircuitBreakerFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MiddlewareFactory for CircuitBreakerFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(&self, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>> {
        let spec: CircuitBreakerSpec = serde_json::from_value(settings.clone())
            .map_err(|e| ProxyError::InvalidFormat(format!("{} settings: {}", KIND, e)))?;
        Ok(Arc::new(CircuitBreaker::from_spec(spec, Arc::clone(&self.clock))?))
    }
}
