//! Shutdown coordination for the proxy.

use tokio_util::sync::CancellationToken;

/// Coordinator for graceful and forced shutdown.
///
/// Clones share state; any task can trigger or await either stage.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    graceful: CancellationToken,
    forced: CancellationToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful shutdown.
    pub fn trigger(&self) {
        self.graceful.cancel();
    }

    /// Request an immediate shutdown.
    pub fn force(&self) {
        self.forced.cancel();
        self.graceful.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.graceful.is_cancelled()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_cancelled()
    }

    /// Resolves once any shutdown was requested.
    pub async fn triggered(&self) {
        self.graceful.cancelled().await
    }

    /// Resolves once an immediate shutdown was requested.
    pub async fn forced(&self) {
        self.forced.cancelled().await
    }
}
