//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum application for one server instance
//! - Wire up layers (request id, tracing)
//! - Serve a listener until its cancellation token fires
//! - Dispatch requests: route, body limit, middleware pipeline, forward
//! - Observability (metrics, round-trip stats)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::http::request::{request_id_header, MakeRequestUuid, RequestContext};
use crate::http::response::{error_response, not_found};
use crate::middleware::Pipeline;
use crate::observability::metrics;
use crate::proxy::{forward, Outcome, ServerCore};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ServerCore>,
}

/// Build the Axum application with all layers.
pub fn build_app(core: Arc<ServerCore>) -> Router {
    let timeout = core.request_timeout;
    let app = Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(AppState { core });
    let app = match timeout {
        Some(timeout) => app.layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)),
        None => app,
    };
    app.layer(PropagateRequestIdLayer::new(request_id_header()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
}

/// Serve `listener` until `shutdown` fires, then drain open connections.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken, listener_id: String) {
    let address = listener.local_addr().ok();
    tracing::info!(listener = %listener_id, address = ?address, "HTTP server starting");

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, service)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(listener = %listener_id, error = %e, "HTTP server failed");
    }

    tracing::info!(listener = %listener_id, "HTTP server stopped");
}

/// Reject oversized bodies. A declared length is checked up front, an
/// undeclared one is buffered up to the limit.
async fn limit_body(headers: &HeaderMap, body: Body, max: u64) -> Result<Body, Response> {
    let too_large = || {
        error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {} bytes", max),
        )
    };
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    match declared {
        Some(len) if len > max => Err(too_large()),
        Some(_) => Ok(body),
        None => {
            let limit = usize::try_from(max).unwrap_or(usize::MAX);
            axum::body::to_bytes(body, limit)
                .await
                .map(Body::from)
                .map_err(|_| too_large())
        }
    }
}

/// Main proxy handler.
/// Looks up the frontend, runs its middlewares and forwards the request.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let _in_flight = state.core.tracker.track();
    let (mut parts, body) = request.into_parts();
    let method = parts.method.to_string();
    let mut ctx = RequestContext::from_parts(&parts, Some(client));

    // 1. Match frontend
    let Some(matched) = state.core.router.route(&parts.method, ctx.host(), ctx.path()) else {
        tracing::debug!(request_id = %ctx.request_id, path = %ctx.path(), "No route matched");
        metrics::record_request(&method, 404, "none", start);
        return not_found();
    };
    let frontend = matched.target;
    let spec = frontend.spec();
    ctx.frontend_id = spec.id.clone();
    ctx.params = matched.params;

    // 2. Body limit
    let body = match spec.settings.limits.max_body_bytes {
        0 => body,
        max => match limit_body(&parts.headers, body, max).await {
            Ok(body) => body,
            Err(response) => {
                frontend.record(Outcome::Status(response.status()), start.elapsed());
                metrics::record_request(&method, response.status().as_u16(), &spec.id, start);
                return response;
            }
        },
    };

    // 3. Middlewares, then upstream
    let ctx = Arc::new(ctx);
    let mut pipeline = Pipeline::new(frontend.chain(), Arc::clone(&ctx));
    let decision = match pipeline.process_request() {
        Ok(None) => pipeline.rewrite_request(&mut parts).map(|()| None),
        answered => answered,
    };
    let (response, outcome) = match decision {
        Ok(Some(response)) => {
            let status = response.status();
            (response, Outcome::Status(status))
        }
        Ok(None) => forward::forward(&frontend, &spec.settings, &ctx, parts, body).await,
        Err(e) => {
            tracing::warn!(request_id = %ctx.request_id, frontend = %spec.id, error = %e, "Middleware failed request");
            let response = e.into_response();
            let status = response.status();
            (response, Outcome::Status(status))
        }
    };
    pipeline.complete(outcome);
    drop(pipeline);

    frontend.record(outcome, start.elapsed());
    metrics::record_request(&method, response.status().as_u16(), &spec.id, start);
    response
}
