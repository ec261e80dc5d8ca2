//! Upstream server abstraction.
//!
//! # Responsibilities
//! - Represent a single server of a backend pool
//! - Track in-flight requests
//! - Accumulate round-trip stats that survive unrelated pool updates

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::uri::{Authority, Scheme, Uri};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::model::Server;
use crate::proxy::stats::{RoundTripCounters, RoundTripStats};

/// A single upstream server.
#[derive(Debug)]
pub struct Upstream {
    id: String,
    url: Url,
    /// Pre-parsed `host:port` for request rewriting.
    authority: Authority,
    /// Path prefix from the server URL, without trailing `/`.
    base_path: String,
    active: AtomicUsize,
    stats: RoundTripCounters,
}

impl Upstream {
    pub fn new(server: &Server) -> Result<Self> {
        let url = server.parsed_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidFormat(format!("server {} has no host", server.id)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        // IPv6 hosts come back bracketed
        let authority = format!("{}:{}", host, port);
        let authority = Authority::try_from(authority.as_str())
            .map_err(|e| ProxyError::InvalidFormat(format!("server {}: {}", server.id, e)))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        Ok(Self {
            id: server.id.clone(),
            url,
            authority,
            base_path,
            active: AtomicUsize::new(0),
            stats: RoundTripCounters::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Authority sent upstream when the client host is not passed through.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Number of requests currently in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> &RoundTripCounters {
        &self.stats
    }

    pub fn stats(&self) -> RoundTripStats {
        self.stats.snapshot()
    }

    /// Upstream URI for a client request path and query.
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri> {
        let joined = format!("{}{}", self.base_path, path_and_query);
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(joined)
            .build()
            .map_err(|e| ProxyError::InvalidFormat(format!("upstream uri: {}", e)))
    }

    /// Mark one request in flight until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> UpstreamGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        UpstreamGuard {
            upstream: self.clone(),
        }
    }
}

/// A RAII guard that manages the in-flight count.
#[derive(Debug)]
pub struct UpstreamGuard {
    upstream: Arc<Upstream>,
}

impl Deref for UpstreamGuard {
    type Target = Upstream;
    fn deref(&self) -> &Self::Target {
        &self.upstream
    }
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        self.upstream.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_uri_joins_base_path() {
        let up = Upstream::new(&Server::new("s1", "http://127.0.0.1:9000/api/")).unwrap();
        assert_eq!(up.authority().as_str(), "127.0.0.1:9000");
        let uri = up.target_uri("/users?id=1").unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/api/users?id=1");
    }

    #[test]
    fn default_port_is_filled_in() {
        let up = Upstream::new(&Server::new("s1", "http://backend.local")).unwrap();
        assert_eq!(up.authority().as_str(), "backend.local:80");
    }

    #[test]
    fn guard_tracks_in_flight() {
        let up = Arc::new(Upstream::new(&Server::new("s1", "http://127.0.0.1:9000")).unwrap());
        let g1 = up.acquire();
        let g2 = up.acquire();
        assert_eq!(up.active(), 2);
        drop(g1);
        assert_eq!(g2.active(), 1);
        drop(g2);
        assert_eq!(up.active(), 0);
    }
}
