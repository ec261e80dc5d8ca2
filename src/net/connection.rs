//! In-flight request tracking.
//!
//! # Responsibilities
//! - Count requests currently being served by one server instance
//! - Let shutdown wait until the count reaches zero

use std::sync::Arc;

use tokio::sync::watch;

/// Tracks in-flight requests for graceful shutdown.
///
/// Uses a watch channel so waiters wake exactly when the count changes.
#[derive(Debug, Clone)]
pub struct RequestTracker {
    active: Arc<watch::Sender<u64>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Record a new in-flight request. Returns a guard that decrements on drop.
    pub fn track(&self) -> RequestGuard {
        self.active.send_modify(|n| *n += 1);
        RequestGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until no request is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // Err only if the sender is gone, which `self` prevents
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a request's lifetime.
#[derive(Debug)]
pub struct RequestGuard {
    active: Arc<watch::Sender<u64>>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}
