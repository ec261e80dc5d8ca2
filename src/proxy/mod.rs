//! Server instance: the apply layer between change events and traffic.
//!
//! # Data Flow
//! ```text
//! ChangeEvent
//!     → ProxyServer::apply (one upsert/delete per event kind)
//!         hosts / listeners  → inner maps, sockets bound and served
//!         backends / servers → BackendPool (load_balancer)
//!         frontends          → Router<Arc<FrontendRuntime>> (routing)
//!         middlewares        → MiddlewareChain of the frontend
//!
//! Request (http::server)
//!     → core.router.route → FrontendRuntime
//!     → Pipeline → forward.rs → upstream
//!     → stats.rs (frontend + server round-trip counters)
//! ```
//!
//! # Design Decisions
//! - Every operation validates before touching live state, so a failed
//!   apply leaves the server exactly as it was
//! - Structural maps sit behind one mutex held only by the applier and
//!   stats readers; the request path reads the router and pools lock-free
//! - A frontend's backend must exist when the frontend is upserted, and a
//!   backend cannot be deleted while a frontend refers to it
//! - Listeners bound by a predecessor are adopted by address, so a hot
//!   restart never closes a listening socket

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::load_balancer::BackendPool;
use crate::middleware::{ChainEntry, MiddlewareRegistry};
use crate::model::{
    Backend, BackendKey, ChangeEvent, Frontend, FrontendKey, Host, HostKey, Listener, ListenerKey,
    MiddlewareKey, MiddlewareSpec, Server, ServerKey, Snapshot,
};
use crate::net::{BoundListener, RequestTracker};
use crate::routing::Router;

pub mod forward;
pub mod frontend;
pub mod stats;

pub use frontend::FrontendRuntime;
pub use stats::{Outcome, RoundTripStats};

/// State read by request handlers.
#[derive(Debug)]
pub struct ServerCore {
    pub server_id: u64,
    pub router: Router<Arc<FrontendRuntime>>,
    pub tracker: RequestTracker,
    /// Whole-request timeout applied by the HTTP layer.
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Accepting configuration, not serving.
    Init,
    Active,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Registered before any replayed configuration.
    pub default_listener: Option<Listener>,
    /// Upper bound on a graceful stop.
    pub drain_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            default_listener: None,
            drain_timeout: Duration::from_secs(30),
            request_timeout: None,
        }
    }
}

#[derive(Debug)]
struct Serving {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct ListenerEntry {
    spec: Listener,
    /// Kept after serving starts so it can be handed to a successor.
    socket: Option<BoundListener>,
    serving: Option<Serving>,
}

#[derive(Debug)]
struct BackendEntry {
    pool: Arc<BackendPool>,
    frontends: BTreeSet<FrontendKey>,
}

#[derive(Debug)]
struct Inner {
    state: ServerState,
    hosts: BTreeMap<HostKey, Host>,
    listeners: BTreeMap<ListenerKey, ListenerEntry>,
    backends: HashMap<BackendKey, BackendEntry>,
    frontends: HashMap<FrontendKey, Arc<FrontendRuntime>>,
}

/// One server instance.
///
/// The supervisor owns exactly one current instance; a hot restart builds a
/// fresh one, replays configuration into it and hands it the sockets of
/// the old one.
#[derive(Debug)]
pub struct ProxyServer {
    core: Arc<ServerCore>,
    registry: Arc<MiddlewareRegistry>,
    options: ServerOptions,
    inner: Mutex<Inner>,
}

impl ProxyServer {
    pub fn new(id: u64, registry: Arc<MiddlewareRegistry>, options: ServerOptions) -> Self {
        let mut listeners = BTreeMap::new();
        if let Some(default) = &options.default_listener {
            listeners.insert(
                default.key(),
                ListenerEntry {
                    spec: default.clone(),
                    socket: None,
                    serving: None,
                },
            );
        }
        Self {
            core: Arc::new(ServerCore {
                server_id: id,
                router: Router::new(),
                tracker: RequestTracker::new(),
                request_timeout: options.request_timeout,
            }),
            registry,
            options,
            inner: Mutex::new(Inner {
                state: ServerState::Init,
                hosts: BTreeMap::new(),
                listeners,
                backends: HashMap::new(),
                frontends: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.server_id
    }

    pub fn core(&self) -> Arc<ServerCore> {
        Arc::clone(&self.core)
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Requests currently being served.
    pub fn in_flight(&self) -> u64 {
        self.core.tracker.active_count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("proxy server mutex poisoned")
    }

    /// Replay a snapshot. Entities that fail to apply are logged and skipped.
    pub fn init(&self, snapshot: Snapshot) {
        let revision = snapshot.revision;
        let mut applied = 0usize;
        let mut failed = 0usize;
        for event in snapshot.into_events() {
            match self.apply(&event) {
                Ok(()) => applied += 1,
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        server = self.id(),
                        kind = event.kind(),
                        subject = %event.subject(),
                        error = %e,
                        "Skipping entity during replay"
                    );
                }
            }
        }
        tracing::info!(server = self.id(), revision, applied, failed, "Snapshot replayed");
    }

    /// Apply one change. Errors leave the server unchanged.
    pub fn apply(&self, event: &ChangeEvent) -> Result<()> {
        match event {
            ChangeEvent::HostUpserted(host) => self.upsert_host(host.clone()),
            ChangeEvent::HostDeleted(key) => self.delete_host(key),
            ChangeEvent::ListenerUpserted(listener) => self.upsert_listener(listener.clone()),
            ChangeEvent::ListenerDeleted(key) => self.delete_listener(key),
            ChangeEvent::BackendUpserted(backend) => self.upsert_backend(backend),
            ChangeEvent::BackendDeleted(key) => self.delete_backend(key),
            ChangeEvent::ServerUpserted {
                backend_key,
                server,
            } => self.upsert_server(backend_key, server),
            ChangeEvent::ServerDeleted(key) => self.delete_server(key),
            ChangeEvent::FrontendUpserted(frontend) => self.upsert_frontend(frontend.clone()),
            ChangeEvent::FrontendDeleted(key) => self.delete_frontend(key),
            ChangeEvent::MiddlewareUpserted {
                frontend_key,
                middleware,
            } => self.upsert_middleware(frontend_key, middleware),
            ChangeEvent::MiddlewareDeleted(key) => self.delete_middleware(key),
        }
    }

    // --- Hosts ---

    pub fn upsert_host(&self, host: Host) -> Result<()> {
        host.validate()?;
        tracing::info!(server = self.id(), host = %host.name, "Upsert host");
        self.lock().hosts.insert(host.key(), host);
        Ok(())
    }

    pub fn delete_host(&self, key: &HostKey) -> Result<()> {
        tracing::info!(server = self.id(), host = %key, "Delete host");
        self.lock()
            .hosts
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ProxyError::NotFound(format!("host {}", key)))
    }

    pub fn hosts(&self) -> Vec<Host> {
        self.lock().hosts.values().cloned().collect()
    }

    // --- Listeners ---

    pub fn upsert_listener(&self, listener: Listener) -> Result<()> {
        listener.validate()?;
        let key = listener.key();
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some((other, _)) = inner
            .listeners
            .iter()
            .find(|(k, e)| **k != key && e.spec.address.address == listener.address.address)
        {
            return Err(ProxyError::Conflict(format!(
                "listener {} already uses address {}",
                other, listener.address.address
            )));
        }
        tracing::info!(server = self.id(), listener = %key, address = %listener.address.address, "Upsert listener");

        let active = inner.state == ServerState::Active;
        match inner.listeners.get_mut(&key) {
            Some(entry) if entry.spec.address.address == listener.address.address => {
                entry.spec = listener;
                return Ok(());
            }
            Some(entry) => {
                // Address changed: bind the new one before releasing the old.
                let socket = if active {
                    Some(BoundListener::bind(&listener.address.address)?)
                } else {
                    None
                };
                let serving = match &socket {
                    Some(socket) => Some(self.serve(&listener, socket)?),
                    None => None,
                };
                if let Some(old) = entry.serving.take() {
                    old.cancel.cancel();
                }
                entry.spec = listener;
                entry.socket = socket;
                entry.serving = serving;
            }
            None => {
                let mut entry = ListenerEntry {
                    spec: listener,
                    socket: None,
                    serving: None,
                };
                if active {
                    let socket = BoundListener::bind(&entry.spec.address.address)?;
                    entry.serving = Some(self.serve(&entry.spec, &socket)?);
                    entry.socket = Some(socket);
                }
                inner.listeners.insert(key, entry);
            }
        }
        Ok(())
    }

    pub fn delete_listener(&self, key: &ListenerKey) -> Result<()> {
        tracing::info!(server = self.id(), listener = %key, "Delete listener");
        let entry = self
            .lock()
            .listeners
            .remove(key)
            .ok_or_else(|| ProxyError::NotFound(format!("listener {}", key)))?;
        if let Some(serving) = entry.serving {
            serving.cancel.cancel();
        }
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Listener> {
        self.lock().listeners.values().map(|e| e.spec.clone()).collect()
    }

    /// Local address of a bound listener.
    pub fn listener_addr(&self, key: &ListenerKey) -> Option<SocketAddr> {
        self.lock()
            .listeners
            .get(key)
            .and_then(|e| e.socket.as_ref())
            .and_then(|s| s.local_addr().ok())
    }

    /// Duplicates of every bound socket, for a successor server.
    pub fn listener_sockets(&self) -> Result<Vec<(Listener, BoundListener)>> {
        let inner = self.lock();
        let mut sockets = Vec::new();
        for entry in inner.listeners.values() {
            if let Some(socket) = &entry.socket {
                sockets.push((entry.spec.clone(), socket.try_clone()?));
            }
        }
        Ok(sockets)
    }

    /// Adopt sockets bound by a predecessor, matching listeners by address.
    /// Sockets nothing here listens on any more are closed.
    pub fn take_listeners(&self, sockets: Vec<(Listener, BoundListener)>) {
        let mut inner = self.lock();
        for (spec, socket) in sockets {
            let entry = inner
                .listeners
                .values_mut()
                .find(|e| e.socket.is_none() && e.spec.address.address == spec.address.address);
            match entry {
                Some(entry) => {
                    tracing::info!(server = self.id(), listener = %entry.spec.id, address = %spec.address.address, "Adopted listener socket");
                    entry.socket = Some(socket);
                }
                None => {
                    tracing::info!(server = self.id(), listener = %spec.id, address = %spec.address.address, "Closing listener socket no longer configured");
                }
            }
        }
    }

    fn serve(&self, listener: &Listener, socket: &BoundListener) -> Result<Serving> {
        let tcp = socket.try_clone()?.into_tokio()?;
        let cancel = CancellationToken::new();
        let app = crate::http::server::build_app(self.core());
        let handle = tokio::spawn(crate::http::server::serve(
            tcp,
            app,
            cancel.clone(),
            listener.id.clone(),
        ));
        Ok(Serving { cancel, handle })
    }

    /// Bind every listener without an adopted socket, then serve them all.
    /// Nothing is served if any bind fails.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != ServerState::Init {
            return Err(ProxyError::Conflict(format!(
                "server {} is already started",
                self.id()
            )));
        }
        for entry in inner.listeners.values_mut() {
            if entry.socket.is_none() {
                entry.socket = Some(BoundListener::bind(&entry.spec.address.address)?);
            }
        }
        for entry in inner.listeners.values_mut() {
            if let Some(socket) = &entry.socket {
                entry.serving = Some(self.serve(&entry.spec, socket)?);
            }
        }
        inner.state = ServerState::Active;
        tracing::info!(server = self.id(), listeners = inner.listeners.len(), "Server started");
        Ok(())
    }

    /// Stop accepting. A graceful stop waits for in-flight requests up to
    /// the drain timeout; anything left after that is aborted.
    pub async fn stop(&self, graceful: bool) {
        let servings: Vec<Serving> = {
            let mut inner = self.lock();
            inner.state = ServerState::ShuttingDown;
            inner
                .listeners
                .values_mut()
                .filter_map(|e| {
                    e.socket = None;
                    e.serving.take()
                })
                .collect()
        };
        tracing::info!(server = self.id(), graceful, in_flight = self.in_flight(), "Stopping server");
        for serving in &servings {
            serving.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        for mut serving in servings {
            if !graceful {
                serving.handle.abort();
                continue;
            }
            if tokio::time::timeout_at(deadline, &mut serving.handle).await.is_err() {
                tracing::warn!(server = self.id(), "Drain timeout reached, aborting connections");
                serving.handle.abort();
            }
        }
        if graceful
            && tokio::time::timeout_at(deadline, self.core.tracker.wait_idle())
                .await
                .is_err()
        {
            tracing::warn!(
                server = self.id(),
                in_flight = self.in_flight(),
                "Requests still in flight after drain timeout"
            );
        }
        tracing::info!(server = self.id(), "Server stopped");
    }

    // --- Backends and servers ---

    pub fn upsert_backend(&self, backend: &Backend) -> Result<()> {
        backend.validate()?;
        let mut inner = self.lock();
        match inner.backends.get(&backend.key()) {
            Some(entry) => {
                if entry.pool.update_settings(&backend.settings) {
                    tracing::info!(server = self.id(), backend = %backend.id, "Updated backend settings");
                }
            }
            None => {
                tracing::info!(server = self.id(), backend = %backend.id, "Upsert backend");
                inner.backends.insert(
                    backend.key(),
                    BackendEntry {
                        pool: Arc::new(BackendPool::new(backend)),
                        frontends: BTreeSet::new(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn delete_backend(&self, key: &BackendKey) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .backends
            .get(key)
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", key)))?;
        if let Some(user) = entry.frontends.iter().next() {
            return Err(ProxyError::Conflict(format!(
                "backend {} is used by frontend {}",
                key, user
            )));
        }
        inner.backends.remove(key);
        tracing::info!(server = self.id(), backend = %key, "Delete backend");
        Ok(())
    }

    /// Add or replace a server. A missing backend is created with default
    /// settings.
    pub fn upsert_server(&self, backend_key: &BackendKey, server: &Server) -> Result<()> {
        let mut inner = self.lock();
        match inner.backends.get(backend_key) {
            Some(entry) => entry.pool.upsert_server(server)?,
            None => {
                // Only commit the backend once its first server is accepted.
                let pool = BackendPool::new(&Backend::new(backend_key.id.clone()));
                pool.upsert_server(server)?;
                tracing::info!(server = self.id(), backend = %backend_key, "Created backend for server");
                inner.backends.insert(
                    backend_key.clone(),
                    BackendEntry {
                        pool: Arc::new(pool),
                        frontends: BTreeSet::new(),
                    },
                );
            }
        }
        tracing::info!(server = self.id(), upstream = %format!("{}.{}", backend_key, server.id), url = %server.url, "Upsert server");
        Ok(())
    }

    pub fn delete_server(&self, key: &ServerKey) -> Result<()> {
        let inner = self.lock();
        let entry = inner
            .backends
            .get(&key.backend_key)
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", key.backend_key)))?;
        entry.pool.remove_server(&key.id)?;
        tracing::info!(server = self.id(), upstream = %key, "Delete server");
        Ok(())
    }

    pub fn backends(&self) -> Vec<Backend> {
        let inner = self.lock();
        let mut backends: Vec<Backend> = inner
            .backends
            .values()
            .map(|e| Backend {
                id: e.pool.id().to_string(),
                settings: e.pool.settings(),
            })
            .collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }

    pub fn servers(&self, key: &BackendKey) -> Result<Vec<Server>> {
        let inner = self.lock();
        let entry = inner
            .backends
            .get(key)
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", key)))?;
        Ok(entry
            .pool
            .servers()
            .iter()
            .map(|s| Server::new(s.id(), s.url().as_str()))
            .collect())
    }

    // --- Frontends ---

    pub fn upsert_frontend(&self, frontend: Frontend) -> Result<()> {
        frontend.validate()?;
        let key = frontend.key();
        let backend_key = frontend.backend_key();
        let mut inner = self.lock();
        let pool = inner
            .backends
            .get(&backend_key)
            .map(|e| Arc::clone(&e.pool))
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", backend_key)))?;

        match inner.frontends.get(&key).cloned() {
            Some(runtime) => {
                let old = runtime.spec();
                if old.route != frontend.route {
                    self.core
                        .router
                        .replace_route(&old.route, &frontend.route, Arc::clone(&runtime))?;
                }
                if old.backend_id != frontend.backend_id {
                    if let Some(entry) = inner.backends.get_mut(&old.backend_key()) {
                        entry.frontends.remove(&key);
                    }
                    if let Some(entry) = inner.backends.get_mut(&backend_key) {
                        entry.frontends.insert(key.clone());
                    }
                    runtime.set_backend(pool);
                }
                runtime.set_spec(frontend);
                tracing::info!(server = self.id(), frontend = %key, "Updated frontend");
            }
            None => {
                let route = frontend.route.clone();
                let runtime = Arc::new(FrontendRuntime::new(frontend, pool));
                self.core.router.add_route(&route, Arc::clone(&runtime))?;
                if let Some(entry) = inner.backends.get_mut(&backend_key) {
                    entry.frontends.insert(key.clone());
                }
                inner.frontends.insert(key.clone(), runtime);
                tracing::info!(server = self.id(), frontend = %key, route = %route, "Upsert frontend");
            }
        }
        Ok(())
    }

    pub fn delete_frontend(&self, key: &FrontendKey) -> Result<()> {
        let mut inner = self.lock();
        let runtime = inner
            .frontends
            .remove(key)
            .ok_or_else(|| ProxyError::NotFound(format!("frontend {}", key)))?;
        let spec = runtime.spec();
        self.core.router.remove_route(&spec.route);
        if let Some(entry) = inner.backends.get_mut(&spec.backend_key()) {
            entry.frontends.remove(key);
        }
        tracing::info!(server = self.id(), frontend = %key, "Delete frontend");
        Ok(())
    }

    pub fn frontends(&self) -> Vec<Frontend> {
        let inner = self.lock();
        let mut frontends: Vec<Frontend> = inner
            .frontends
            .values()
            .map(|r| Frontend::clone(&r.spec()))
            .collect();
        frontends.sort_by(|a, b| a.id.cmp(&b.id));
        frontends
    }

    fn frontend(&self, key: &FrontendKey) -> Result<Arc<FrontendRuntime>> {
        self.lock()
            .frontends
            .get(key)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("frontend {}", key)))
    }

    // --- Middlewares ---

    pub fn upsert_middleware(&self, frontend_key: &FrontendKey, spec: &MiddlewareSpec) -> Result<()> {
        spec.validate()?;
        let runtime = self.frontend(frontend_key)?;
        let middleware = self.registry.build(&spec.kind, &spec.middleware)?;
        runtime.chain().upsert(ChainEntry {
            id: spec.id.clone(),
            priority: spec.priority,
            kind: spec.kind.clone(),
            middleware,
        });
        tracing::info!(
            server = self.id(),
            middleware = %format!("{}.{}", frontend_key, spec.id),
            kind = %spec.kind,
            priority = spec.priority,
            "Upsert middleware"
        );
        Ok(())
    }

    pub fn delete_middleware(&self, key: &MiddlewareKey) -> Result<()> {
        let runtime = self.frontend(&key.frontend_key)?;
        runtime.chain().remove(&key.id)?;
        tracing::info!(server = self.id(), middleware = %key, "Delete middleware");
        Ok(())
    }

    /// Ids of a frontend's middlewares in execution order.
    pub fn middleware_ids(&self, key: &FrontendKey) -> Result<Vec<String>> {
        Ok(self.frontend(key)?.chain().ids())
    }

    // --- Stats ---

    pub fn frontend_stats(&self, key: &FrontendKey) -> Result<RoundTripStats> {
        Ok(self.frontend(key)?.stats())
    }

    pub fn backend_stats(&self, key: &BackendKey) -> Result<RoundTripStats> {
        let inner = self.lock();
        inner
            .backends
            .get(key)
            .map(|e| e.pool.stats())
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", key)))
    }

    pub fn server_stats(&self, key: &ServerKey) -> Result<RoundTripStats> {
        let inner = self.lock();
        let entry = inner
            .backends
            .get(&key.backend_key)
            .ok_or_else(|| ProxyError::NotFound(format!("backend {}", key.backend_key)))?;
        entry
            .pool
            .server(&key.id)
            .map(|s| s.stats())
            .ok_or_else(|| ProxyError::NotFound(format!("server {}", key)))
    }

    /// Frontends worst first, optionally only those using `backend`.
    pub fn top_frontends(
        &self,
        limit: usize,
        backend: Option<&BackendKey>,
    ) -> Vec<(FrontendKey, RoundTripStats)> {
        let inner = self.lock();
        let mut items: Vec<_> = inner
            .frontends
            .iter()
            .filter(|(_, r)| backend.map_or(true, |b| r.spec().backend_key() == *b))
            .map(|(k, r)| (k.clone(), r.stats()))
            .collect();
        drop(inner);
        stats::rank(&mut items);
        items.truncate(limit);
        items
    }

    /// Servers worst first, optionally only those of `backend`.
    pub fn top_servers(
        &self,
        limit: usize,
        backend: Option<&BackendKey>,
    ) -> Vec<(ServerKey, RoundTripStats)> {
        let inner = self.lock();
        let mut items: Vec<_> = inner
            .backends
            .iter()
            .filter(|(k, _)| backend.map_or(true, |b| *k == b))
            .flat_map(|(k, e)| {
                e.pool.servers().into_iter().map(move |s| {
                    (
                        ServerKey {
                            backend_key: k.clone(),
                            id: s.id().to_string(),
                        },
                        s.stats(),
                    )
                })
            })
            .collect();
        drop(inner);
        stats::rank(&mut items);
        items.truncate(limit);
        items
    }
}
