//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tokio::net::TcpListener;

use hotwire::middleware::MiddlewareRegistry;
use hotwire::model::{Backend, BackendKey, Frontend, Listener, Server};
use hotwire::proxy::{ProxyServer, ServerOptions};

/// Start a backend that echoes what it received as JSON:
/// `{"name", "path", "host", "forwarded_for", "forwarded_host"}`.
pub async fn start_echo_backend(addr: SocketAddr, name: &'static str) {
    let app = axum::Router::new().fallback(move |req: Request| async move {
        let header = |h: &str| {
            req.headers()
                .get(h)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Json(json!({
            "name": name,
            "path": req.uri().path(),
            "host": header("host"),
            "forwarded_for": header("x-forwarded-for"),
            "forwarded_host": header("x-forwarded-host"),
        }))
    });
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

/// Start a backend whose responses come from `f`.
pub async fn start_programmable_backend<F, Fut>(addr: SocketAddr, f: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let f = Arc::new(f);
    let app = axum::Router::new().fallback(move || {
        let f = f.clone();
        async move {
            let (status, body) = f().await;
            (StatusCode::from_u16(status).unwrap(), body).into_response()
        }
    });
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
}

/// Proxy listening on `addr` with a single backend `b1` made of `servers`.
pub fn start_proxy(
    id: u64,
    addr: SocketAddr,
    registry: MiddlewareRegistry,
    servers: &[SocketAddr],
) -> ProxyServer {
    let options = ServerOptions {
        default_listener: Some(Listener::http("default", addr.to_string())),
        drain_timeout: Duration::from_secs(2),
        ..ServerOptions::default()
    };
    let proxy = ProxyServer::new(id, Arc::new(registry), options);
    proxy.upsert_backend(&Backend::new("b1")).unwrap();
    for (i, server) in servers.iter().enumerate() {
        proxy
            .upsert_server(
                &BackendKey::new("b1"),
                &Server::new(format!("s{}", i + 1), format!("http://{}", server)),
            )
            .unwrap();
    }
    proxy.start().unwrap();
    proxy
}

pub fn frontend(id: &str, route: &str) -> Frontend {
    Frontend::new(id, "b1", route)
}

/// Non-pooled client so every request opens a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Like `client`, but hands redirects back to the caller.
pub fn client_without_redirects() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Poll `url` until it answers with `expected`, panicking after two seconds.
pub async fn wait_for_status(client: &reqwest::Client, url: &str, expected: u16) {
    for _ in 0..100 {
        if let Ok(res) = client.get(url).send().await {
            if res.status().as_u16() == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never answered {}", url, expected);
}
