//! Typed configuration changes.

use super::{
    Backend, BackendKey, Frontend, FrontendKey, Host, HostKey, Listener, ListenerKey,
    MiddlewareKey, MiddlewareSpec, Server, ServerKey,
};

/// One classified store mutation.
///
/// Upserts carry the full decoded entity, deletes only its key.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    HostUpserted(Host),
    HostDeleted(HostKey),
    ListenerUpserted(Listener),
    ListenerDeleted(ListenerKey),
    BackendUpserted(Backend),
    BackendDeleted(BackendKey),
    ServerUpserted {
        backend_key: BackendKey,
        server: Server,
    },
    ServerDeleted(ServerKey),
    FrontendUpserted(Frontend),
    FrontendDeleted(FrontendKey),
    MiddlewareUpserted {
        frontend_key: FrontendKey,
        middleware: MiddlewareSpec,
    },
    MiddlewareDeleted(MiddlewareKey),
}

impl ChangeEvent {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::HostUpserted(_) => "host_upserted",
            ChangeEvent::HostDeleted(_) => "host_deleted",
            ChangeEvent::ListenerUpserted(_) => "listener_upserted",
            ChangeEvent::ListenerDeleted(_) => "listener_deleted",
            ChangeEvent::BackendUpserted(_) => "backend_upserted",
            ChangeEvent::BackendDeleted(_) => "backend_deleted",
            ChangeEvent::ServerUpserted { .. } => "server_upserted",
            ChangeEvent::ServerDeleted(_) => "server_deleted",
            ChangeEvent::FrontendUpserted(_) => "frontend_upserted",
            ChangeEvent::FrontendDeleted(_) => "frontend_deleted",
            ChangeEvent::MiddlewareUpserted { .. } => "middleware_upserted",
            ChangeEvent::MiddlewareDeleted(_) => "middleware_deleted",
        }
    }

    /// Identifier of the entity the event is about.
    pub fn subject(&self) -> String {
        match self {
            ChangeEvent::HostUpserted(h) => h.name.clone(),
            ChangeEvent::HostDeleted(k) => k.to_string(),
            ChangeEvent::ListenerUpserted(l) => l.id.clone(),
            ChangeEvent::ListenerDeleted(k) => k.to_string(),
            ChangeEvent::BackendUpserted(b) => b.id.clone(),
            ChangeEvent::BackendDeleted(k) => k.to_string(),
            ChangeEvent::ServerUpserted {
                backend_key,
                server,
            } => format!("{}.{}", backend_key, server.id),
            ChangeEvent::ServerDeleted(k) => k.to_string(),
            ChangeEvent::FrontendUpserted(f) => f.id.clone(),
            ChangeEvent::FrontendDeleted(k) => k.to_string(),
            ChangeEvent::MiddlewareUpserted {
                frontend_key,
                middleware,
            } => format!("{}.{}", frontend_key, middleware.id),
            ChangeEvent::MiddlewareDeleted(k) => k.to_string(),
        }
    }
}
