//! URL rewrites and redirects end to end.

use std::net::SocketAddr;

use hotwire::middleware::MiddlewareRegistry;
use hotwire::model::{FrontendKey, MiddlewareSpec};
use serde_json::{json, Value};

mod common;

#[tokio::test]
async fn rewritten_path_reaches_upstream() {
    let backend_addr: SocketAddr = "127.0.0.1:28401".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28402".parse().unwrap();
    common::start_echo_backend(backend_addr, "rewritten").await;

    let proxy = common::start_proxy(1, proxy_addr, MiddlewareRegistry::with_defaults(), &[backend_addr]);
    let key = FrontendKey::new("f1");
    proxy.upsert_frontend(common::frontend("f1", r#"Path("/v1/users")"#)).unwrap();
    proxy
        .upsert_middleware(
            &key,
            &MiddlewareSpec::new(
                "rw",
                0,
                "rewrite",
                json!({"regexp": "^http://[^/]+/v1/(.*)$", "replacement": "/api/$1"}),
            ),
        )
        .unwrap();

    let client = common::client();
    let res = client
        .get(format!("http://{}/v1/users?page=2", proxy_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["path"], "/api/users");
    // the client's host still goes upstream as the forwarded host
    assert_eq!(body["forwarded_host"], proxy_addr.to_string());

    proxy.stop(true).await;
}

#[tokio::test]
async fn redirect_points_client_elsewhere() {
    let backend_addr: SocketAddr = "127.0.0.1:28411".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28412".parse().unwrap();
    common::start_echo_backend(backend_addr, "moved").await;

    let proxy = common::start_proxy(1, proxy_addr, MiddlewareRegistry::with_defaults(), &[backend_addr]);
    proxy.upsert_frontend(common::frontend("old", r#"Path("/old/page")"#)).unwrap();
    proxy.upsert_frontend(common::frontend("new", r#"Path("/new/page")"#)).unwrap();
    proxy
        .upsert_middleware(
            &FrontendKey::new("old"),
            &MiddlewareSpec::new(
                "moved",
                0,
                "rewrite",
                json!({
                    "regexp": "^http://([^/]+)/old/(.*)$",
                    "replacement": "http://$1/new/$2",
                    "redirect": true
                }),
            ),
        )
        .unwrap();

    let res = common::client_without_redirects()
        .get(format!("http://{}/old/page", proxy_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 302);
    assert_eq!(
        res.headers()["location"],
        format!("http://{}/new/page", proxy_addr).as_str()
    );

    // followed, the redirect lands on the other frontend
    let res = common::client()
        .get(format!("http://{}/old/page", proxy_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["path"], "/new/page");

    // redirected requests never reach the upstream
    let stats = proxy.frontend_stats(&FrontendKey::new("old")).unwrap();
    assert_eq!(stats.status_3xx, 2);
    assert_eq!(proxy.frontend_stats(&FrontendKey::new("new")).unwrap().requests, 1);

    proxy.stop(true).await;
}
