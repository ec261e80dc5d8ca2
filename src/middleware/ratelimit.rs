//! `ratelimit` middleware: token bucket per mapped token.

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::{Middleware, MiddlewareFactory};
use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::http::response::too_many_requests;
use crate::observability::metrics;
use crate::security::{Clock, Rate, SystemClock, TokenLimiter, TokenMapper};

pub const KIND: &str = "ratelimit";

/// JSON settings of a `ratelimit` middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    #[serde(default = "default_variable")]
    pub variable: String,
    pub requests: u64,
    #[serde(default = "default_period")]
    pub period_seconds: u64,
    /// Zero means "same as `requests`".
    #[serde(default)]
    pub burst: u64,
}

fn default_variable() -> String {
    "client.ip".to_string()
}

fn default_period() -> u64 {
    1
}

#[derive(Debug)]
pub struct RateLimit {
    spec: RateLimitSpec,
    mapper: TokenMapper,
    limiter: TokenLimiter,
}

impl RateLimit {
    pub fn from_spec(spec: RateLimitSpec, clock: Arc<dyn Clock>) -> Result<Self> {
        let mapper = TokenMapper::parse(&spec.variable)?;
        let rate = Rate::new(spec.requests, Duration::from_secs(spec.period_seconds))?;
        let burst = if spec.burst == 0 { spec.requests } else { spec.burst };
        Ok(Self {
            limiter: TokenLimiter::new(rate, burst, clock),
            mapper,
            spec,
        })
    }

    pub fn spec(&self) -> &RateLimitSpec {
        &self.spec
    }
}

impl Middleware for RateLimit {
    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Response>> {
        let (token, amount) = self.mapper.map(ctx)?;
        let wait = self.limiter.consume(&token, amount)?;
        if wait.is_zero() {
            return Ok(None);
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            token = %token,
            wait = ?wait,
            "Rate limit exceeded"
        );
        metrics::record_rejected("rate_limit");
        Ok(Some(too_many_requests("rate limit exceeded", Some(wait))))
    }
}

pub struct RateLimitFactory {
    clock: Arc<dyn Clock>,
}

impl RateLimitFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for RateLimitFactory {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MiddlewareFactory for RateLimitFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(&self, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>> {
        let spec: RateLimitSpec = serde_json::from_value(settings.clone())
            .map_err(|e| ProxyError::InvalidFormat(format!("{} settings: {}", KIND, e)))?;
        Ok(Arc::new(RateLimit::from_spec(spec, Arc::clone(&self.clock))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ManualClock;
    use axum::http::{header, StatusCode};
    use serde_json::json;

    #[test]
    fn rejects_with_retry_after() {
        let clock = Arc::new(ManualClock::new());
        let factory = RateLimitFactory::new(clock.clone());
        let mw = factory
            .build(&json!({"variable": "client.ip", "requests": 1, "period_seconds": 1}))
            .unwrap();
        let ctx = RequestContext::for_test("10.0.0.1:4000", "a.com");

        assert!(mw.process_request(&ctx).unwrap().is_none());
        let rejected = mw.process_request(&ctx).unwrap().unwrap();
        assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejected.headers()[header::RETRY_AFTER], "1");

        clock.advance(Duration::from_secs(1));
        assert!(mw.process_request(&ctx).unwrap().is_none());
    }

    #[test]
    fn burst_defaults_to_requests() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let spec = RateLimitSpec {
            variable: "client.ip".into(),
            requests: 3,
            period_seconds: 1,
            burst: 0,
        };
        let mw = RateLimit::from_spec(spec, clock).unwrap();
        let ctx = RequestContext::for_test("10.0.0.1:4000", "a.com");
        for _ in 0..3 {
            assert!(mw.process_request(&ctx).unwrap().is_none());
        }
        assert!(mw.process_request(&ctx).unwrap().is_some());
    }

    #[test]
    fn invalid_settings() {
        let factory = RateLimitFactory::default();
        assert!(factory.build(&json!({"requests": 0})).is_err());
        assert!(factory.build(&json!({"variable": "nope", "requests": 1})).is_err());
        assert!(factory.build(&json!({"period_seconds": 1})).is_err());
    }

    #[test]
    fn mapping_failure_is_an_error() {
        let factory = RateLimitFactory::default();
        let mw = factory.build(&json!({"requests": 1})).unwrap();
        let ctx = RequestContext::for_test("unknown", "a.com");
        assert!(matches!(mw.process_request(&ctx), Err(ProxyError::Mapping(_))));
    }
}
