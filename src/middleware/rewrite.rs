//! `rewrite` middleware: regex rewrite of the request URL.
//!
//! The pattern runs against `http://<host><path>?<query>`, or against the
//! path and query alone when the request carries no host. Replacements may
//! reference capture groups as `$1` or `${name}`.
//!
//! With `redirect` set, a matching request is answered with a 302 to the
//! rewritten URL. Otherwise the rewritten path and query replace the ones
//! forwarded upstream; scheme and host of the rewritten URL are ignored
//! since the backend decides where the request goes.

use std::sync::Arc;

use axum::http::request::Parts;
use axum::http::uri::PathAndQuery;
use axum::http::Uri;
use axum::response::Response;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Middleware, MiddlewareFactory};
use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::http::response::found;

pub const KIND: &str = "rewrite";

/// JSON settings of a `rewrite` middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteSpec {
    pub regexp: String,
    pub replacement: String,
    #[serde(default)]
    pub redirect: bool,
}

#[derive(Debug)]
pub struct Rewrite {
    spec: RewriteSpec,
    regexp: Regex,
}

impl Rewrite {
    pub fn from_spec(spec: RewriteSpec) -> Result<Self> {
        let regexp = Regex::new(&spec.regexp)
            .map_err(|e| ProxyError::syntax(spec.regexp.clone(), e.to_string()))?;
        Ok(Self { spec, regexp })
    }

    pub fn spec(&self) -> &RewriteSpec {
        &self.spec
    }

    /// The rewritten URL, or `None` when the pattern does not match.
    fn apply(&self, ctx: &RequestContext, uri: &Uri) -> Option<String> {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let raw = match ctx.host() {
            Some(host) => format!("http://{}{}", host, path_and_query),
            None => path_and_query.to_string(),
        };
        if !self.regexp.is_match(&raw) {
            return None;
        }
        Some(
            self.regexp
                .replace_all(&raw, self.spec.replacement.as_str())
                .into_owned(),
        )
    }
}

/// Path and query of a rewritten URL, absolute or not.
fn forwarded_part(rewritten: &str) -> Result<Uri> {
    let invalid = || ProxyError::InvalidFormat(format!("rewritten url '{}' is not valid", rewritten));
    let uri: Uri = rewritten.parse().map_err(|_| invalid())?;
    let path_and_query = match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.clone(),
        _ => PathAndQuery::from_static("/"),
    };
    Ok(Uri::from(path_and_query))
}

impl Middleware for Rewrite {
    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Response>> {
        if !self.spec.redirect {
            return Ok(None);
        }
        match self.apply(ctx, &ctx.uri) {
            Some(location) => {
                tracing::debug!(request_id = %ctx.request_id, location = %location, "Redirecting request");
                Ok(Some(found(&location)))
            }
            None => Ok(None),
        }
    }

    fn rewrite_request(&self, ctx: &RequestContext, parts: &mut Parts) -> Result<()> {
        if self.spec.redirect {
            return Ok(());
        }
        if let Some(rewritten) = self.apply(ctx, &parts.uri) {
            let uri = forwarded_part(&rewritten)?;
            tracing::debug!(request_id = %ctx.request_id, from = %parts.uri, to = %uri, "Rewrote request");
            parts.uri = uri;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RewriteFactory;

impl MiddlewareFactory for RewriteFactory {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build(&self, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>> {
        let spec: RewriteSpec = serde_json::from_value(settings.clone())
            .map_err(|e| ProxyError::InvalidFormat(format!("{} settings: {}", KIND, e)))?;
        Ok(Arc::new(Rewrite::from_spec(spec)?))
    }
}
