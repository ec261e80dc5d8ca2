//! Rate and connection limits enforced end to end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hotwire::middleware::ratelimit::RateLimitFactory;
use hotwire::middleware::MiddlewareRegistry;
use hotwire::model::{FrontendKey, MiddlewareSpec};
use hotwire::security::ManualClock;
use serde_json::json;

mod common;

#[tokio::test]
async fn rate_limit_rejects_until_tokens_refill() {
    let backend_addr: SocketAddr = "127.0.0.1:28201".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28202".parse().unwrap();
    common::start_echo_backend(backend_addr, "limited").await;

    let clock = Arc::new(ManualClock::new());
    let mut registry = MiddlewareRegistry::with_defaults();
    registry.replace(Arc::new(RateLimitFactory::new(clock.clone())));

    let proxy = common::start_proxy(1, proxy_addr, registry, &[backend_addr]);
    let key = FrontendKey::new("f1");
    proxy.upsert_frontend(common::frontend("f1", r#"Path("/")"#)).unwrap();
    proxy
        .upsert_middleware(
            &key,
            &MiddlewareSpec::new(
                "rl",
                0,
                "ratelimit",
                json!({"variable": "client.ip", "requests": 2, "period_seconds": 1}),
            ),
        )
        .unwrap();

    let client = common::client();
    let url = format!("http://{}/", proxy_addr);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), 429);
    assert!(res.headers().contains_key("retry-after"));

    clock.advance(Duration::from_secs(1));
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

    // rejected requests never reach the upstream
    let stats = proxy.frontend_stats(&key).unwrap();
    assert_eq!(stats.status_2xx, 3);

    proxy.stop(true).await;
}

#[tokio::test]
async fn rate_limit_keyed_by_header() {
    let backend_addr: SocketAddr = "127.0.0.1:28211".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28212".parse().unwrap();
    common::start_echo_backend(backend_addr, "limited").await;

    let clock = Arc::new(ManualClock::new());
    let mut registry = MiddlewareRegistry::with_defaults();
    registry.replace(Arc::new(RateLimitFactory::new(clock)));

    let proxy = common::start_proxy(1, proxy_addr, registry, &[backend_addr]);
    let key = FrontendKey::new("f1");
    proxy.upsert_frontend(common::frontend("f1", r#"Path("/")"#)).unwrap();
    proxy
        .upsert_middleware(
            &key,
            &MiddlewareSpec::new(
                "rl",
                0,
                "ratelimit",
                json!({"variable": "request.header.X-Api-Key", "requests": 1}),
            ),
        )
        .unwrap();

    let client = common::client();
    let url = format!("http://{}/", proxy_addr);
    let send = |key: &'static str| client.get(&url).header("x-api-key", key).send();

    assert_eq!(send("alice").await.unwrap().status(), 200);
    assert_eq!(send("alice").await.unwrap().status(), 429);
    assert_eq!(send("bob").await.unwrap().status(), 200);

    proxy.stop(true).await;
}

#[tokio::test]
async fn connection_limit_caps_in_flight_requests() {
    let backend_addr: SocketAddr = "127.0.0.1:28221".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28222".parse().unwrap();
    common::start_programmable_backend(backend_addr, || async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        (200, "slow".to_string())
    })
    .await;

    let proxy = common::start_proxy(1, proxy_addr, MiddlewareRegistry::with_defaults(), &[backend_addr]);
    let key = FrontendKey::new("f1");
    proxy.upsert_frontend(common::frontend("f1", r#"Path("/")"#)).unwrap();
    proxy
        .upsert_middleware(
            &key,
            &MiddlewareSpec::new("cl", 0, "connlimit", json!({"connections": 1})),
        )
        .unwrap();

    let client = common::client();
    let url = format!("http://{}/", proxy_addr);

    let first = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move { client.get(&url).send().await.unwrap().status() })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(client.get(&url).send().await.unwrap().status(), 429);
    assert_eq!(first.await.unwrap(), 200);

    // the slot is released once the first response completed
    assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

    proxy.stop(true).await;
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let backend_addr: SocketAddr = "127.0.0.1:28231".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28232".parse().unwrap();
    common::start_echo_backend(backend_addr, "small").await;

    let proxy = common::start_proxy(1, proxy_addr, MiddlewareRegistry::with_defaults(), &[backend_addr]);
    let mut frontend = common::frontend("f1", r#"Path("/upload")"#);
    frontend.settings.limits.max_body_bytes = 16;
    proxy.upsert_frontend(frontend).unwrap();

    let client = common::client();
    let url = format!("http://{}/upload", proxy_addr);
    let res = client.post(&url).body("tiny").send().await.unwrap();
    assert_eq!(res.status(), 200);

    let res = client.post(&url).body(vec![b'x'; 1024]).send().await.unwrap();
    assert_eq!(res.status(), 413);

    proxy.stop(true).await;
}
