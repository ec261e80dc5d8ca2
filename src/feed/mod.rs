//! Change feed: raw store mutations → typed `ChangeEvent`s.
//!
//! # Data Flow
//! ```text
//! store.watch(prefix, rev)
//!     → WatchEvent { op, key, value, revision }
//!     → keys.rs (classify key path)
//!     → decode JSON value (puts only), id taken from the key
//!     → ChangeEvent → bounded channel → supervisor applier
//!
//! store.list(prefix)
//!     → Snapshot (cold start and hot-restart replay)
//! ```
//!
//! # Design Decisions
//! - Unknown keys are structural noise and are skipped
//! - A matched key whose value does not decode is logged and skipped;
//!   only a broken stream is a feed failure
//! - Puts decode the value carried by the watch event, which is exactly the
//!   value at that revision

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::model::{
    Backend, BackendKey, BackendSpec, ChangeEvent, Frontend, FrontendKey, FrontendSpec, Host,
    HostKey, Listener, ListenerKey, MiddlewareKey, MiddlewareSpec, Server, ServerKey, Snapshot,
};
use crate::store::{ConfigStore, WatchEvent, WatchOp};

pub mod keys;

pub use keys::{KeyKind, Keys};

pub struct ChangeFeed {
    store: Arc<dyn ConfigStore>,
    keys: Keys,
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed").field("keys", &self.keys).finish()
    }
}

impl ChangeFeed {
    pub fn new(store: Arc<dyn ConfigStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            keys: Keys::new(prefix),
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Read every entity under the prefix.
    ///
    /// Servers whose backend has no entity key get a default backend, the
    /// same way a live server upsert creates one. Middlewares of a missing
    /// frontend are dropped.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let listing = self.store.list(&self.keys.root()).await?;

        let mut hosts = Vec::new();
        let mut listeners = Vec::new();
        let mut backends: BTreeMap<String, BackendSpec> = BTreeMap::new();
        let mut servers: Vec<(String, Server)> = Vec::new();
        let mut frontends: BTreeMap<String, FrontendSpec> = BTreeMap::new();
        let mut middlewares: Vec<(String, MiddlewareSpec)> = Vec::new();

        for kv in listing.entries {
            let Some(kind) = self.keys.classify(&kv.key) else {
                tracing::debug!(key = %kv.key, "Skipping unknown key");
                continue;
            };
            let decoded = match kind {
                KeyKind::Host { name } => decode::<Host>(&kv.key, &kv.value).map(|mut h| {
                    h.name = name;
                    hosts.push(h);
                }),
                KeyKind::Listener { id } => decode::<Listener>(&kv.key, &kv.value).map(|mut l| {
                    l.id = id;
                    listeners.push(l);
                }),
                KeyKind::Backend { id } => decode::<Backend>(&kv.key, &kv.value).map(|mut b| {
                    b.id = id.clone();
                    backends.insert(
                        id,
                        BackendSpec {
                            backend: b,
                            servers: Vec::new(),
                        },
                    );
                }),
                KeyKind::Server { backend, id } => decode::<Server>(&kv.key, &kv.value).map(|mut s| {
                    s.id = id;
                    servers.push((backend, s));
                }),
                KeyKind::Frontend { id } => decode::<Frontend>(&kv.key, &kv.value).map(|mut f| {
                    f.id = id.clone();
                    frontends.insert(
                        id,
                        FrontendSpec {
                            frontend: f,
                            middlewares: Vec::new(),
                        },
                    );
                }),
                KeyKind::Middleware { frontend, id } => {
                    decode::<MiddlewareSpec>(&kv.key, &kv.value).map(|mut m| {
                        m.id = id;
                        middlewares.push((frontend, m));
                    })
                }
            };
            if let Err(e) = decoded {
                tracing::error!(key = %kv.key, error = %e, "Skipping undecodable entity");
            }
        }

        for (backend, server) in servers {
            backends
                .entry(backend.clone())
                .or_insert_with(|| BackendSpec {
                    backend: Backend::new(backend),
                    servers: Vec::new(),
                })
                .servers
                .push(server);
        }
        for (frontend, middleware) in middlewares {
            match frontends.get_mut(&frontend) {
                Some(spec) => spec.middlewares.push(middleware),
                None => tracing::warn!(
                    frontend = %frontend,
                    middleware = %middleware.id,
                    "Dropping middleware of missing frontend"
                ),
            }
        }

        Ok(Snapshot {
            revision: listing.revision,
            hosts,
            listeners,
            backends: backends.into_values().collect(),
            frontends: frontends.into_values().collect(),
        })
    }

    /// Turn one store mutation into a typed event.
    ///
    /// `Ok(None)` for keys outside the schema, an error when the value of a
    /// known key does not decode.
    pub fn classify(&self, event: &WatchEvent) -> Result<Option<ChangeEvent>> {
        let Some(kind) = self.keys.classify(&event.key) else {
            return Ok(None);
        };
        let value = match (event.op, event.value.as_deref()) {
            (WatchOp::Delete, _) => return Ok(Some(deleted(kind))),
            (WatchOp::Put, Some(value)) => value,
            (WatchOp::Put, None) => {
                return Err(ProxyError::InvalidFormat(format!(
                    "put of '{}' carries no value",
                    event.key
                )))
            }
        };

        let key = event.key.as_str();
        let change = match kind {
            KeyKind::Server { backend, id } => {
                let mut server: Server = decode(key, value)?;
                server.id = id;
                ChangeEvent::ServerUpserted {
                    backend_key: BackendKey::new(backend),
                    server,
                }
            }
            KeyKind::Backend { id } => {
                let mut backend: Backend = decode(key, value)?;
                backend.id = id;
                ChangeEvent::BackendUpserted(backend)
            }
            KeyKind::Middleware { frontend, id } => {
                let mut middleware: MiddlewareSpec = decode(key, value)?;
                middleware.id = id;
                ChangeEvent::MiddlewareUpserted {
                    frontend_key: FrontendKey::new(frontend),
                    middleware,
                }
            }
            KeyKind::Frontend { id } => {
                let mut frontend: Frontend = decode(key, value)?;
                frontend.id = id;
                ChangeEvent::FrontendUpserted(frontend)
            }
            KeyKind::Host { name } => {
                let mut host: Host = decode(key, value)?;
                host.name = name;
                ChangeEvent::HostUpserted(host)
            }
            KeyKind::Listener { id } => {
                let mut listener: Listener = decode(key, value)?;
                listener.id = id;
                ChangeEvent::ListenerUpserted(listener)
            }
        };
        Ok(Some(change))
    }

    /// Stream typed events after `after_revision` into `tx` until `cancel`
    /// fires (returns `Ok`) or the store watch fails (returns the error).
    ///
    /// A closed receiver also ends the subscription with `Ok`.
    pub async fn subscribe(
        &self,
        tx: mpsc::Sender<ChangeEvent>,
        after_revision: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let root = self.keys.root();
        let mut watch = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            watch = self.store.watch(&root, after_revision) => watch?,
        };
        tracing::info!(revision = after_revision, prefix = %self.keys.prefix(), "Watching for changes");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = watch.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e),
                None => return Err(ProxyError::Feed("watch stream ended".into())),
            };

            let change = match self.classify(&event) {
                Ok(Some(change)) => change,
                Ok(None) => {
                    tracing::debug!(key = %event.key, "Skipping unknown key");
                    continue;
                }
                Err(e) => {
                    tracing::error!(key = %event.key, revision = event.revision, error = %e, "Skipping change");
                    continue;
                }
            };
            tracing::debug!(kind = change.kind(), subject = %change.subject(), revision = event.revision, "Change received");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = tx.send(change) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn deleted(kind: KeyKind) -> ChangeEvent {
    match kind {
        KeyKind::Server { backend, id } => ChangeEvent::ServerDeleted(ServerKey {
            backend_key: BackendKey::new(backend),
            id,
        }),
        KeyKind::Backend { id } => ChangeEvent::BackendDeleted(BackendKey::new(id)),
        KeyKind::Middleware { frontend, id } => ChangeEvent::MiddlewareDeleted(MiddlewareKey {
            frontend_key: FrontendKey::new(frontend),
            id,
        }),
        KeyKind::Frontend { id } => ChangeEvent::FrontendDeleted(FrontendKey::new(id)),
        KeyKind::Host { name } => ChangeEvent::HostDeleted(HostKey { name }),
        KeyKind::Listener { id } => ChangeEvent::ListenerDeleted(ListenerKey { id }),
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|source| ProxyError::Decode {
        key: key.to_string(),
        source,
    })
}
