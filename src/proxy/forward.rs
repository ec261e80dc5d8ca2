//! Upstream forwarding for a matched frontend.
//!
//! # Responsibilities
//! - Pick a server from the frontend's backend pool
//! - Rewrite the request for the upstream (URI, hop-by-hop headers,
//!   `Host`, `X-Forwarded-*`)
//! - Enforce the backend read timeout
//! - Record per-server round-trip stats

use std::time::Instant;

use axum::{
    body::Body,
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Version},
    response::Response,
};

use super::frontend::FrontendRuntime;
use super::stats::Outcome;
use crate::http::request::RequestContext;
use crate::http::response::error_response;
use crate::model::FrontendSettings;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn set_forward_headers(
    headers: &mut HeaderMap,
    ctx: &RequestContext,
    settings: &FrontendSettings,
) {
    let trust = settings.trust_forward_header;

    if let Some(client) = ctx.client_addr {
        let ip = client.ip().to_string();
        let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if trust => format!("{}, {}", prior, ip),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    } else if !trust {
        headers.remove(X_FORWARDED_FOR);
    }

    if !(trust && headers.contains_key(X_FORWARDED_PROTO)) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !(trust && headers.contains_key(X_FORWARDED_HOST)) {
        match ctx.host().and_then(|h| HeaderValue::from_str(h).ok()) {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host);
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
    }
}

/// Send the request to the next server of the frontend's backend.
///
/// Proxy-generated failures are rendered here: 503 for an empty pool, 504
/// for a read timeout, 502 for any other upstream failure.
pub async fn forward(
    frontend: &FrontendRuntime,
    settings: &FrontendSettings,
    ctx: &RequestContext,
    parts: Parts,
    body: Body,
) -> (Response, Outcome) {
    let pool = frontend.backend();
    let Some(selection) = pool.select() else {
        tracing::warn!(
            request_id = %ctx.request_id,
            frontend = %frontend.key(),
            backend = %pool.id(),
            "No servers available"
        );
        let response = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("no servers available for backend {}", pool.id()),
        );
        return (response, Outcome::Status(StatusCode::SERVICE_UNAVAILABLE));
    };
    let upstream = &selection.upstream;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = match upstream.target_uri(path_and_query) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(request_id = %ctx.request_id, server = %upstream.id(), error = %e, "Failed to build upstream URI");
            let response = error_response(StatusCode::BAD_GATEWAY, "invalid upstream address");
            return (response, Outcome::NetworkError);
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    set_forward_headers(&mut headers, ctx, settings);
    if !settings.pass_host_header {
        if let Ok(host) = HeaderValue::from_str(upstream.authority().as_str()) {
            headers.insert(header::HOST, host);
        }
    }

    let mut request = Request::new(body);
    *request.method_mut() = parts.method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = headers;

    tracing::debug!(
        request_id = %ctx.request_id,
        frontend = %frontend.key(),
        server = %upstream.id(),
        uri = %request.uri(),
        "Forwarding request"
    );

    let started = Instant::now();
    let sent = selection.client.request(request);
    let result = match selection.read_timeout {
        Some(limit) => match tokio::time::timeout(limit, sent).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => {
                upstream.counters().record(Outcome::NetworkError, started.elapsed());
                tracing::warn!(
                    request_id = %ctx.request_id,
                    server = %upstream.id(),
                    timeout = ?limit,
                    "Upstream read timeout"
                );
                let response = error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
                return (response, Outcome::NetworkError);
            }
        },
        None => sent.await.map_err(|e| e.to_string()),
    };

    match result {
        Ok(response) => {
            let status = response.status();
            upstream.counters().record(Outcome::Status(status), started.elapsed());
            let (mut parts, body): (_, hyper::body::Incoming) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            (Response::from_parts(parts, Body::new(body)), Outcome::Status(status))
        }
        Err(e) => {
            upstream.counters().record(Outcome::NetworkError, started.elapsed());
            tracing::error!(
                request_id = %ctx.request_id,
                server = %upstream.id(),
                error = %e,
                "Upstream error"
            );
            let response = error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
            (response, Outcome::NetworkError)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn forwarded_for_is_replaced_unless_trusted() {
        let mut ctx = RequestContext::for_test("10.0.0.1:5000", "a.com");
        ctx.headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));

        let mut headers = ctx.headers.clone();
        set_forward_headers(&mut headers, &ctx, &FrontendSettings::default());
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_FORWARDED_HOST], "a.com");

        let trusted = FrontendSettings {
            trust_forward_header: true,
            ..Default::default()
        };
        let mut headers = ctx.headers.clone();
        set_forward_headers(&mut headers, &ctx, &trusted);
        assert_eq!(headers[X_FORWARDED_FOR], "1.1.1.1, 10.0.0.1");
    }
}
