//! Bound listening sockets with descriptor handoff.
//!
//! # Responsibilities
//! - Bind to a listener address
//! - Duplicate the socket for a successor server
//! - Convert into a tokio listener once serving starts

use std::net::SocketAddr;

use crate::error::ProxyError;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind { address: String, source: std::io::Error },
    /// Failed to duplicate or adopt a bound socket.
    Handoff(std::io::Error),
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind { address, source } => {
                write!(f, "Failed to bind {}: {}", address, source)
            }
            ListenerError::Handoff(e) => write!(f, "Failed to hand off socket: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind { source, .. } => Some(source),
            ListenerError::Handoff(e) => Some(e),
        }
    }
}

impl From<ListenerError> for ProxyError {
    fn from(err: ListenerError) -> Self {
        let kind = match &err {
            ListenerError::Bind { source, .. } => source.kind(),
            ListenerError::Handoff(e) => e.kind(),
        };
        ProxyError::Io(std::io::Error::new(kind, err.to_string()))
    }
}

/// A bound, non-blocking TCP socket not yet accepting.
#[derive(Debug)]
pub struct BoundListener {
    address: String,
    inner: std::net::TcpListener,
}

impl BoundListener {
    /// Bind to `address` (`host:port`).
    pub fn bind(address: &str) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind {
            address: address.to_string(),
            source,
        };
        let inner = std::net::TcpListener::bind(address).map_err(bind_err)?;
        inner.set_nonblocking(true).map_err(bind_err)?;
        let local = inner.local_addr().map_err(bind_err)?;
        tracing::info!(address = %address, local_addr = %local, "Listener bound");
        Ok(Self {
            address: address.to_string(),
            inner,
        })
    }

    /// Configured address, as given to `bind`.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Duplicate the descriptor. Both copies accept from the same socket.
    pub fn try_clone(&self) -> Result<Self, ListenerError> {
        let inner = self.inner.try_clone().map_err(ListenerError::Handoff)?;
        Ok(Self {
            address: self.address.clone(),
            inner,
        })
    }

    /// Must be called from within a tokio runtime.
    pub fn into_tokio(self) -> Result<tokio::net::TcpListener, ListenerError> {
        tokio::net::TcpListener::from_std(self.inner).map_err(ListenerError::Handoff)
    }
}
