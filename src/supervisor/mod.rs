//! Supervisor: owns the current server and keeps it in sync with the feed.
//!
//! # Data Flow
//! ```text
//! start()
//!     → feed.snapshot() → new ProxyServer → init(snapshot) → start()
//!     → reader task:  feed.subscribe(tx, snapshot.revision, stop)
//!     → applier task: rx → server.apply(event), in order
//!
//! Feed failure (reader returns Err):
//!     Running → Restarting
//!     → snapshot → new server → init → take_listeners(old) → start
//!     → swap current → old.stop(graceful) in background
//!     → resubscribe from the new snapshot revision
//!     → Running (or retry every retry_period, Stopped after max attempts)
//! ```
//!
//! # Design Decisions
//! - One owning struct instead of process globals; tasks share it by `Arc`
//! - Reader and applier are connected by a bounded channel, so a slow
//!   applier back-pressures the watch instead of buffering without bound
//! - A bad event is logged and skipped; only a broken feed restarts
//! - Both servers accept on the shared sockets briefly during a swap

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{ProxyError, Result};
use crate::feed::ChangeFeed;
use crate::model::{BackendKey, ChangeEvent, FrontendKey, ServerKey};
use crate::observability::metrics;
use crate::proxy::{ProxyServer, RoundTripStats};

/// Builds a fresh server instance for a generation number.
pub type ServerFactory = Arc<dyn Fn(u64) -> ProxyServer + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initializing,
    Running,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Pause between failed restart attempts.
    pub retry_period: Duration,
    /// Consecutive failed restarts before giving up.
    pub max_restart_attempts: u32,
    /// Capacity of the reader → applier channel.
    pub changes_buffer: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            retry_period: Duration::from_secs(5),
            max_restart_attempts: 10,
            changes_buffer: 2000,
        }
    }
}

struct Shared {
    feed: Arc<ChangeFeed>,
    new_server: ServerFactory,
    options: SupervisorOptions,
    current: RwLock<Option<Arc<ProxyServer>>>,
    state: watch::Sender<SupervisorState>,
    generation: AtomicU64,
    restarts: AtomicU64,
    failure: Mutex<Option<String>>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    run: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("restarts", &self.restarts())
            .finish()
    }
}

impl Supervisor {
    pub fn new(feed: Arc<ChangeFeed>, new_server: ServerFactory, options: SupervisorOptions) -> Self {
        let (state, _) = watch::channel(SupervisorState::Initializing);
        Self {
            shared: Arc::new(Shared {
                feed,
                new_server,
                options,
                current: RwLock::new(None),
                state,
                generation: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                failure: Mutex::new(None),
                stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Build and start the first server, then follow the feed in the
    /// background. Fails if the first server cannot be built.
    pub async fn start(&self) -> Result<()> {
        let (server, revision) = build_generation(&self.shared).await?;
        self.shared.state.send_replace(SupervisorState::Running);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(supervise(shared, server, revision));
        *self.run.lock().expect("supervisor mutex poisoned") = Some(handle);
        Ok(())
    }

    /// Stop following the feed and stop the current server.
    pub async fn stop(&self, graceful: bool) {
        tracing::info!(graceful, "Stopping supervisor");
        self.shared.stop.cancel();
        let run = self.run.lock().expect("supervisor mutex poisoned").take();
        if let Some(run) = run {
            if let Err(e) = run.await {
                tracing::error!(error = %e, "Supervisor task failed");
            }
        }
        let current = self
            .shared
            .current
            .write()
            .expect("supervisor lock poisoned")
            .take();
        if let Some(server) = current {
            server.stop(graceful).await;
        }
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        self.shared.state.send_replace(SupervisorState::Stopped);
        tracing::info!("Supervisor stopped");
    }

    /// Resolves once the supervisor is stopped. An error means it stopped
    /// because restarts kept failing.
    pub async fn stopped(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        // the sender lives in `shared`, so this only ends on Stopped
        let _ = rx.wait_for(|s| *s == SupervisorState::Stopped).await;
        match self.shared.failure.lock().expect("supervisor mutex poisoned").take() {
            Some(reason) => Err(ProxyError::Fatal(reason)),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    /// Hot restarts performed so far.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    pub fn current(&self) -> Option<Arc<ProxyServer>> {
        self.shared.current.read().expect("supervisor lock poisoned").clone()
    }

    fn server(&self) -> Result<Arc<ProxyServer>> {
        self.current()
            .ok_or_else(|| ProxyError::NotFound("running server".into()))
    }

    pub fn frontend_stats(&self, key: &FrontendKey) -> Result<RoundTripStats> {
        self.server()?.frontend_stats(key)
    }

    pub fn backend_stats(&self, key: &BackendKey) -> Result<RoundTripStats> {
        self.server()?.backend_stats(key)
    }

    pub fn server_stats(&self, key: &ServerKey) -> Result<RoundTripStats> {
        self.server()?.server_stats(key)
    }

    pub fn top_frontends(
        &self,
        limit: usize,
        backend: Option<&BackendKey>,
    ) -> Result<Vec<(FrontendKey, RoundTripStats)>> {
        Ok(self.server()?.top_frontends(limit, backend))
    }

    pub fn top_servers(
        &self,
        limit: usize,
        backend: Option<&BackendKey>,
    ) -> Result<Vec<(ServerKey, RoundTripStats)>> {
        Ok(self.server()?.top_servers(limit, backend))
    }
}

/// Build a server from a fresh snapshot, take over the sockets of the
/// current one and swap it in. Returns the server and the snapshot revision.
async fn build_generation(shared: &Arc<Shared>) -> Result<(Arc<ProxyServer>, u64)> {
    let snapshot = shared.feed.snapshot().await?;
    let revision = snapshot.revision;
    let id = shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let server = Arc::new((shared.new_server)(id));
    server.init(snapshot);

    let old = shared.current.read().expect("supervisor lock poisoned").clone();
    if let Some(old) = &old {
        server.take_listeners(old.listener_sockets()?);
    }
    if let Err(e) = server.start() {
        server.stop(false).await;
        return Err(e);
    }

    *shared.current.write().expect("supervisor lock poisoned") = Some(Arc::clone(&server));
    if let Some(old) = old {
        tracing::info!(old = old.id(), new = id, "Swapped server, draining old one");
        shared.tasks.spawn(async move { old.stop(true).await });
    }
    tracing::info!(server = id, revision, "Server running");
    Ok((server, revision))
}

/// Follow the feed, restarting on feed failure, until stopped.
async fn supervise(shared: Arc<Shared>, mut server: Arc<ProxyServer>, mut revision: u64) {
    loop {
        let result = follow_changes(&shared, Arc::clone(&server), revision).await;
        if shared.stop.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => return,
            Err(e) => tracing::warn!(server = server.id(), error = %e, "Change feed failed, restarting"),
        }

        shared.state.send_replace(SupervisorState::Restarting);
        match restart(&shared).await {
            Ok(Some((next, next_revision))) => {
                server = next;
                revision = next_revision;
                shared.restarts.fetch_add(1, Ordering::Relaxed);
                metrics::record_restart();
                shared.state.send_replace(SupervisorState::Running);
            }
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "Giving up on restarts");
                *shared.failure.lock().expect("supervisor mutex poisoned") = Some(e.to_string());
                shared.state.send_replace(SupervisorState::Stopped);
                return;
            }
        }
    }
}

/// Retry `build_generation` on a fixed period. `Ok(None)` when stopped
/// while retrying.
async fn restart(shared: &Arc<Shared>) -> Result<Option<(Arc<ProxyServer>, u64)>> {
    let max = shared.options.max_restart_attempts.max(1);
    for attempt in 1..=max {
        match build_generation(shared).await {
            Ok(generation) => return Ok(Some(generation)),
            Err(e) => tracing::warn!(attempt, max, error = %e, "Restart failed"),
        }
        if attempt == max {
            break;
        }
        tokio::select! {
            _ = shared.stop.cancelled() => return Ok(None),
            _ = tokio::time::sleep(shared.options.retry_period) => {}
        }
    }
    Err(ProxyError::Fatal(format!(
        "server could not be rebuilt after {} attempts",
        max
    )))
}

/// Run the reader and applier tasks for one server. Returns the reader's
/// result once both have finished.
async fn follow_changes(shared: &Arc<Shared>, server: Arc<ProxyServer>, revision: u64) -> Result<()> {
    let (tx, rx) = mpsc::channel(shared.options.changes_buffer.max(1));
    let cancel = shared.stop.child_token();

    let applier = shared
        .tasks
        .spawn(apply_changes(server, rx, cancel.clone()));
    let feed = Arc::clone(&shared.feed);
    let reader = shared
        .tasks
        .spawn(async move { feed.subscribe(tx, revision, cancel).await });

    let result = match reader.await {
        Ok(result) => result,
        Err(e) => Err(ProxyError::Feed(format!("change reader failed: {}", e))),
    };
    if let Err(e) = applier.await {
        tracing::error!(error = %e, "Change applier failed");
    }
    result
}

/// Apply events in arrival order until the channel closes or `cancel`
/// fires. Queued events are dropped on cancel.
async fn apply_changes(
    server: Arc<ProxyServer>,
    mut rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match server.apply(&event) {
            Ok(()) => {
                metrics::record_change_event(event.kind(), "ok");
                tracing::debug!(server = server.id(), kind = event.kind(), subject = %event.subject(), "Change applied");
            }
            Err(e) => {
                metrics::record_change_event(event.kind(), "error");
                tracing::error!(
                    server = server.id(),
                    kind = event.kind(),
                    subject = %event.subject(),
                    error = %e,
                    "Failed to apply change"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareRegistry;
    use crate::model::{Backend, Frontend, Server};
    use crate::proxy::ServerOptions;
    use crate::store::MemoryStore;

    fn supervisor(store: &Arc<MemoryStore>) -> Supervisor {
        let feed = Arc::new(ChangeFeed::new(store.clone(), "/hw"));
        let registry = Arc::new(MiddlewareRegistry::with_defaults());
        let factory: ServerFactory =
            Arc::new(move |id| ProxyServer::new(id, Arc::clone(&registry), ServerOptions::default()));
        Supervisor::new(
            feed,
            factory,
            SupervisorOptions {
                retry_period: Duration::from_millis(20),
                max_restart_attempts: 3,
                changes_buffer: 16,
            },
        )
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn applies_live_changes() {
        let store = Arc::new(MemoryStore::new());
        store.put_json("/hw/backends/b1/backend", &Backend::new("b1")).unwrap();
        let sup = supervisor(&store);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), SupervisorState::Running);

        store
            .put_json("/hw/frontends/f1/frontend", &Frontend::new("f1", "b1", r#"Path("/")"#))
            .unwrap();
        eventually(|| sup.current().unwrap().frontends().len() == 1).await;

        // a frontend with a missing backend is skipped, the feed continues
        store
            .put_json("/hw/frontends/f2/frontend", &Frontend::new("f2", "nope", r#"Path("/x")"#))
            .unwrap();
        store
            .put_json("/hw/backends/b1/servers/s1", &Server::new("s1", "http://127.0.0.1:9001"))
            .unwrap();
        eventually(|| sup.server_stats(&ServerKey { backend_key: BackendKey::new("b1"), id: "s1".into() }).is_ok()).await;
        assert_eq!(sup.current().unwrap().frontends().len(), 1);

        sup.stop(true).await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(sup.stopped().await.is_ok());
    }

    #[tokio::test]
    async fn feed_failure_builds_new_generation() {
        let store = Arc::new(MemoryStore::new());
        store.put_json("/hw/backends/b1/backend", &Backend::new("b1")).unwrap();
        store
            .put_json("/hw/frontends/f1/frontend", &Frontend::new("f1", "b1", r#"Path("/")"#))
            .unwrap();
        let sup = supervisor(&store);
        sup.start().await.unwrap();
        let first = sup.current().unwrap().id();

        // keep breaking until the watch is actually open
        let mut attempts = 0;
        while sup.restarts() == 0 && attempts < 200 {
            store.break_watches();
            tokio::time::sleep(Duration::from_millis(10)).await;
            attempts += 1;
        }
        eventually(|| sup.state() == SupervisorState::Running && sup.restarts() > 0).await;
        let current = sup.current().unwrap();
        assert!(current.id() > first);
        assert_eq!(current.frontends().len(), 1);

        sup.stop(false).await;
    }
}
