//! Structured error responses.
//!
//! # Responsibilities
//! - Render proxy-generated failures as `{"error": ..., "status": ...}`
//! - Map backend errors to appropriate HTTP status codes
//!
//! # Design Decisions
//! - Upstream responses are streamed through untouched, only responses
//!   produced by the proxy itself go through here
//! - Backend timeouts result in 504 Gateway Timeout

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ProxyError;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({
        "error": message.into(),
        "status": status.as_u16(),
    });
    (status, Json(body)).into_response()
}

/// 429 with a `Retry-After` header rounded up to whole seconds.
pub fn too_many_requests(message: impl Into<String>, retry_after: Option<Duration>) -> Response {
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, message);
    if let Some(wait) = retry_after {
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

/// 302 pointing at `location`, or an error response if it is not a valid
/// header value.
pub fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid redirect location"),
    }
}

pub fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "no route matched the request")
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_sets_location() {
        let response = found("http://a.com/next");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "http://a.com/next");

        let response = found("http://a.com/\n");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn retry_after_rounds_up() {
        let response = too_many_requests("slow down", Some(Duration::from_millis(1500)));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn proxy_error_renders_status() {
        let response = ProxyError::NotFound("backend b1".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
