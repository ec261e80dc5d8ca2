//! Store-driven configuration and hot restarts under load.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hotwire::feed::ChangeFeed;
use hotwire::middleware::MiddlewareRegistry;
use hotwire::model::{Backend, Frontend, Listener, MiddlewareSpec, Server};
use hotwire::proxy::{ProxyServer, ServerOptions};
use hotwire::store::MemoryStore;
use hotwire::supervisor::{ServerFactory, Supervisor, SupervisorOptions, SupervisorState};
use serde_json::json;

mod common;

const PREFIX: &str = "/hotwire";

fn supervisor(store: &Arc<MemoryStore>, proxy_addr: SocketAddr) -> Supervisor {
    let feed = Arc::new(ChangeFeed::new(store.clone(), PREFIX));
    let registry = Arc::new(MiddlewareRegistry::with_defaults());
    let options = ServerOptions {
        default_listener: Some(Listener::http("default", proxy_addr.to_string())),
        drain_timeout: Duration::from_secs(2),
        ..ServerOptions::default()
    };
    let factory: ServerFactory =
        Arc::new(move |id| ProxyServer::new(id, Arc::clone(&registry), options.clone()));
    Supervisor::new(
        feed,
        factory,
        SupervisorOptions {
            retry_period: Duration::from_millis(50),
            max_restart_attempts: 5,
            changes_buffer: 64,
        },
    )
}

fn seed(store: &MemoryStore, backend_addr: SocketAddr) {
    store
        .put_json(format!("{}/backends/b1/backend", PREFIX), &Backend::new("b1"))
        .unwrap();
    store
        .put_json(
            format!("{}/backends/b1/servers/s1", PREFIX),
            &Server::new("s1", format!("http://{}", backend_addr)),
        )
        .unwrap();
    store
        .put_json(
            format!("{}/frontends/f1/frontend", PREFIX),
            &Frontend::new("f1", "b1", r#"Path("/")"#),
        )
        .unwrap();
}

#[tokio::test]
async fn store_changes_reach_the_data_path() {
    let backend_addr: SocketAddr = "127.0.0.1:28301".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28302".parse().unwrap();
    common::start_echo_backend(backend_addr, "store").await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, backend_addr);
    let sup = supervisor(&store, proxy_addr);
    sup.start().await.unwrap();

    let client = common::client();
    let url = |path: &str| format!("http://{}{}", proxy_addr, path);
    assert_eq!(client.get(url("/")).send().await.unwrap().status(), 200);
    assert_eq!(client.get(url("/new")).send().await.unwrap().status(), 404);

    store
        .put_json(
            format!("{}/frontends/f2/frontend", PREFIX),
            &Frontend::new("f2", "b1", r#"Path("/new")"#),
        )
        .unwrap();
    common::wait_for_status(&client, &url("/new"), 200).await;

    store
        .put_json(
            format!("{}/frontends/f2/middlewares/rl", PREFIX),
            &MiddlewareSpec::new("rl", 0, "ratelimit", json!({"requests": 1, "period_seconds": 3600})),
        )
        .unwrap();
    common::wait_for_status(&client, &url("/new"), 429).await;
    // other frontends are unaffected
    assert_eq!(client.get(url("/")).send().await.unwrap().status(), 200);

    // a listener whose address collides is rejected, the feed keeps going
    store
        .put_json(
            format!("{}/listeners/dup", PREFIX),
            &Listener::http("dup", proxy_addr.to_string()),
        )
        .unwrap();
    store.delete(&format!("{}/frontends/f1/frontend", PREFIX));
    common::wait_for_status(&client, &url("/"), 404).await;
    assert_eq!(sup.state(), SupervisorState::Running);
    assert_eq!(sup.restarts(), 0);

    sup.stop(true).await;
    assert!(client.get(url("/new")).send().await.is_err(), "listener must be closed");
}

#[tokio::test]
async fn hot_restart_keeps_serving() {
    let backend_addr: SocketAddr = "127.0.0.1:28311".parse().unwrap();
    let proxy_addr: SocketAddr = "127.0.0.1:28312".parse().unwrap();
    common::start_echo_backend(backend_addr, "restart").await;

    let store = Arc::new(MemoryStore::new());
    seed(&store, backend_addr);
    let sup = supervisor(&store, proxy_addr);
    sup.start().await.unwrap();
    let first = sup.current().unwrap().id();

    let done = Arc::new(AtomicBool::new(false));
    let ok = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    let load = {
        let (done, ok, failed) = (done.clone(), ok.clone(), failed.clone());
        tokio::spawn(async move {
            let client = common::client();
            while !done.load(Ordering::SeqCst) {
                match client.get(format!("http://{}/", proxy_addr)).send().await {
                    Ok(res) if res.status() == 200 => ok.fetch_add(1, Ordering::SeqCst),
                    _ => failed.fetch_add(1, Ordering::SeqCst),
                };
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut attempts = 0;
    while sup.restarts() == 0 && attempts < 100 {
        store.break_watches();
        tokio::time::sleep(Duration::from_millis(20)).await;
        attempts += 1;
    }
    for _ in 0..100 {
        if sup.state() == SupervisorState::Running && sup.restarts() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sup.restarts() > 0, "breaking the watch must trigger a restart");
    tokio::time::sleep(Duration::from_millis(200)).await;

    done.store(true, Ordering::SeqCst);
    load.await.unwrap();

    let current = sup.current().unwrap();
    assert!(current.id() > first, "a new generation must be serving");
    assert!(ok.load(Ordering::SeqCst) > 0);
    assert_eq!(failed.load(Ordering::SeqCst), 0, "no request may fail across a restart");

    sup.stop(true).await;
    assert_eq!(sup.state(), SupervisorState::Stopped);
}
