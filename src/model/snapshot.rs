//! Point-in-time view of the whole configuration.

use super::{
    Backend, ChangeEvent, Frontend, FrontendKey, Host, Listener, MiddlewareSpec, Server,
};

#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub backend: Backend,
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrontendSpec {
    pub frontend: Frontend,
    pub middlewares: Vec<MiddlewareSpec>,
}

/// Every entity under the prefix at `revision`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub revision: u64,
    pub hosts: Vec<Host>,
    pub listeners: Vec<Listener>,
    pub backends: Vec<BackendSpec>,
    pub frontends: Vec<FrontendSpec>,
}

impl Snapshot {
    /// Synthetic upserts in dependency order: backends, servers, hosts,
    /// listeners, frontends, middlewares.
    pub fn into_events(self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        let mut servers = Vec::new();
        for spec in self.backends {
            let backend_key = spec.backend.key();
            events.push(ChangeEvent::BackendUpserted(spec.backend));
            servers.extend(spec.servers.into_iter().map(|server| ChangeEvent::ServerUpserted {
                backend_key: backend_key.clone(),
                server,
            }));
        }
        events.extend(servers);
        events.extend(self.hosts.into_iter().map(ChangeEvent::HostUpserted));
        events.extend(self.listeners.into_iter().map(ChangeEvent::ListenerUpserted));

        let mut middlewares = Vec::new();
        for spec in self.frontends {
            let frontend_key: FrontendKey = spec.frontend.key();
            events.push(ChangeEvent::FrontendUpserted(spec.frontend));
            middlewares.extend(spec.middlewares.into_iter().map(|middleware| {
                ChangeEvent::MiddlewareUpserted {
                    frontend_key: frontend_key.clone(),
                    middleware,
                }
            }));
        }
        events.extend(middlewares);
        events
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
            && self.listeners.is_empty()
            && self.backends.is_empty()
            && self.frontends.is_empty()
    }
}
