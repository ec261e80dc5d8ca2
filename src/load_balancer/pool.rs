//! Backend pool management.
//!
//! # Responsibilities
//! - Hold the servers of one backend
//! - Own the upstream HTTP client built from the backend settings
//! - Apply the load balancing algorithm and hand out in-flight guards

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};

use crate::error::{ProxyError, Result};
use crate::load_balancer::{
    round_robin::RoundRobin,
    upstream::{Upstream, UpstreamGuard},
    LoadBalancer,
};
use crate::model::{Backend, BackendSettings, Server};
use crate::proxy::stats::RoundTripStats;

pub type UpstreamClient = Client<HttpConnector, Body>;

#[derive(Debug)]
struct PoolState {
    settings: BackendSettings,
    client: UpstreamClient,
    servers: Vec<Arc<Upstream>>,
}

/// The result of picking a server for one request.
#[derive(Debug)]
pub struct Selection {
    pub upstream: UpstreamGuard,
    pub client: UpstreamClient,
    pub read_timeout: Option<Duration>,
}

/// Servers of one backend behind a round-robin balancer.
///
/// Readers load the state without locking; writers serialize on `write`
/// and publish a modified copy.
#[derive(Debug)]
pub struct BackendPool {
    id: String,
    state: ArcSwap<PoolState>,
    write: Mutex<()>,
    balancer: Box<dyn LoadBalancer>,
}

fn build_client(settings: &BackendSettings) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(settings.dial_timeout());
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(settings.idle_timeout())
        .pool_max_idle_per_host(settings.keep_alive.max_idle_per_host)
        .build(connector)
}

impl BackendPool {
    pub fn new(backend: &Backend) -> Self {
        Self {
            id: backend.id.clone(),
            state: ArcSwap::from_pointee(PoolState {
                client: build_client(&backend.settings),
                settings: backend.settings.clone(),
                servers: Vec::new(),
            }),
            write: Mutex::new(()),
            balancer: Box::new(RoundRobin::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> BackendSettings {
        self.state.load().settings.clone()
    }

    /// Replace the settings. The client is rebuilt only when they changed.
    /// Returns true if anything changed.
    pub fn update_settings(&self, settings: &BackendSettings) -> bool {
        let _guard = self.write.lock().expect("backend pool mutex poisoned");
        let current = self.state.load_full();
        if current.settings == *settings {
            return false;
        }
        self.state.store(Arc::new(PoolState {
            settings: settings.clone(),
            client: build_client(settings),
            servers: current.servers.clone(),
        }));
        true
    }

    /// Add or replace a server.
    ///
    /// A server whose URL is unchanged keeps its stats; a new URL starts
    /// from zero.
    pub fn upsert_server(&self, server: &Server) -> Result<()> {
        server.validate()?;
        let _guard = self.write.lock().expect("backend pool mutex poisoned");
        let current = self.state.load_full();
        let mut servers = current.servers.clone();
        match servers.iter().position(|s| s.id() == server.id) {
            Some(i) if servers[i].url().as_str() == server.parsed_url()?.as_str() => return Ok(()),
            Some(i) => servers[i] = Arc::new(Upstream::new(server)?),
            None => servers.push(Arc::new(Upstream::new(server)?)),
        }
        self.publish(&current, servers);
        Ok(())
    }

    pub fn remove_server(&self, id: &str) -> Result<()> {
        let _guard = self.write.lock().expect("backend pool mutex poisoned");
        let current = self.state.load_full();
        let mut servers = current.servers.clone();
        let before = servers.len();
        servers.retain(|s| s.id() != id);
        if servers.len() == before {
            return Err(ProxyError::NotFound(format!("server {}.{}", self.id, id)));
        }
        self.publish(&current, servers);
        Ok(())
    }

    fn publish(&self, current: &PoolState, servers: Vec<Arc<Upstream>>) {
        self.state.store(Arc::new(PoolState {
            settings: current.settings.clone(),
            client: current.client.clone(),
            servers,
        }));
    }

    pub fn servers(&self) -> Vec<Arc<Upstream>> {
        self.state.load().servers.clone()
    }

    pub fn server(&self, id: &str) -> Option<Arc<Upstream>> {
        self.state.load().servers.iter().find(|s| s.id() == id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.state.load().servers.is_empty()
    }

    /// Pick the next server. `None` when the pool has no servers.
    pub fn select(&self) -> Option<Selection> {
        let state = self.state.load();
        let Some(upstream) = self.balancer.next_server(&state.servers) else {
            tracing::debug!(backend = %self.id, "No servers in backend pool");
            return None;
        };
        Some(Selection {
            upstream: upstream.acquire(),
            client: state.client.clone(),
            read_timeout: state.settings.read_timeout(),
        })
    }

    /// Sum of the stats of every server.
    pub fn stats(&self) -> RoundTripStats {
        let mut total = RoundTripStats::default();
        for server in self.state.load().servers.iter() {
            total.merge(&server.stats());
        }
        total
    }
}
