//! `connlimit` middleware: in-flight request ceiling per mapped token.

use std::sync::Arc;

use axum::response::Response;
use serde::{Deserialize, Serialize};

use super::{Middleware, MiddlewareFactory};
use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::http::response::too_many_requests;
use crate::observability::metrics;
use crate::proxy::stats::Outcome;
use crate::security::{ConnectionLimiter, TokenMapper};

pub const KIND: &str = "connlimit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnLimitSpec {
    #[serde(default = "default_variable")]
    pub variable: String,
    pub connections: u64,
}

fn default_variable() -> String {
    "client.ip".to_string()
}

#[derive(Debug)]
pub struct ConnLimit {
    spec: ConnLimitSpec,
    mapper: TokenMapper,
    limiter: ConnectionLimiter,
}

impl ConnLimit {
    pub fn from_spec(spec: ConnLimitSpec) -> Result<Self> {
        if spec.connections == 0 {
            return Err(ProxyError::InvalidFormat(
                "connlimit connections must be positive".into(),
            ));
        }
        Ok(Self {
            mapper: TokenMapper::parse(&spec.variable)?,
            limiter: ConnectionLimiter::new(spec.connections),
            spec,
        })
    }

    pub fn spec(&self) -> &ConnLimitSpec {
        &self.spec
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }
}

impl Middleware for ConnLimit {
    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Response>> {
        let (token, amount) = self.mapper.map(ctx)?;
        if self.limiter.try_acquire(&token, amount) {
            return Ok(None);
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            token = %token,
            max = self.limiter.max_connections(),
            "Connection limit reached"
        );
        metrics::record_rejected("conn_limit");
        Ok(Some(too_many_requests("connection limit reached", None)))
    }

    fn process_response(&self, ctx: &RequestContext, _outcome: Option<Outcome>) {
        match self.mapper.map(ctx) {
            Ok((token, amount)) => self.limiter.release(&token, amount),
            Err(e) => tracing::error!(error = %e, "Failed to map request on completion"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnLimitFactory;

impl MiddlewareFactory for ConnLimitFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(&self, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>> {
        let spec: ConnLimitSpec = serde_json::from_value(settings.clone())
            .map_err(|e| ProxyError::InvalidFormat(format!("{} settings: {}", KIND, e)))?;
        Ok(Arc::new(ConnLimit::from_spec(spec)?))
    }
}
