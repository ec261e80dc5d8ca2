//! Request identification and per-request context.
//!
//! # Responsibilities
//! - Generate a UUID v4 request id when the client sent none
//! - Capture the routing-relevant view of a request for middlewares
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Context is built once per request and shared by reference with every
//!   middleware, so the request/response callbacks see identical input

use std::net::SocketAddr;
use std::time::Instant;

use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

pub fn request_id_header() -> HeaderName {
    HeaderName::from_static(X_REQUEST_ID)
}

/// Generates `x-request-id` values.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Read-only view of a request handed to middlewares.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_addr: Option<SocketAddr>,
    pub frontend_id: String,
    /// Path parameters captured by the route.
    pub params: Vec<(String, String)>,
    pub received_at: Instant,
}

impl RequestContext {
    pub fn from_parts(parts: &Parts, client_addr: Option<SocketAddr>) -> Self {
        let request_id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        Self {
            request_id,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            client_addr,
            frontend_id: String::new(),
            params: Vec::new(),
            received_at: Instant::now(),
        }
    }

    /// Host from the absolute URI, falling back to the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri.authority().map(|a| a.as_str()).or_else(|| {
            self.headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
        })
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

#[cfg(test)]
impl RequestContext {
    /// Minimal context for unit tests.
    pub fn for_test(client: &str, host: &str) -> Self {
        Self {
            request_id: "test".into(),
            method: Method::GET,
            uri: Uri::from_static("/"),
            headers: {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(host) {
                    headers.insert(header::HOST, value);
                }
                headers
            },
            client_addr: client.parse().ok(),
            frontend_id: "test".into(),
            params: Vec::new(),
            received_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_prefers_uri_authority() {
        let req = Request::builder()
            .uri("http://a.com:81/x")
            .header("host", "b.com")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();
        let ctx = RequestContext::from_parts(&parts, None);
        assert_eq!(ctx.host(), Some("a.com:81"));
        assert_eq!(ctx.path(), "/x");
        assert_eq!(ctx.request_id, "unknown");
    }

    #[test]
    fn make_request_id_is_uuid() {
        let req = Request::new(());
        let id = MakeRequestUuid.make_request_id(&req).unwrap();
        let value = id.header_value().to_str().unwrap();
        assert!(Uuid::parse_str(value).is_ok());
    }
}
