//! Live state of one frontend.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use super::stats::{Outcome, RoundTripCounters, RoundTripStats};
use crate::load_balancer::BackendPool;
use crate::middleware::MiddlewareChain;
use crate::model::{Frontend, FrontendKey};

/// Router target for a frontend.
///
/// The runtime is shared by the router and the server maps, so spec and
/// backend are swapped in place rather than re-registering the route.
#[derive(Debug)]
pub struct FrontendRuntime {
    key: FrontendKey,
    spec: ArcSwap<Frontend>,
    backend: ArcSwap<BackendPool>,
    chain: MiddlewareChain,
    stats: RoundTripCounters,
}

impl FrontendRuntime {
    pub fn new(spec: Frontend, backend: Arc<BackendPool>) -> Self {
        Self {
            key: spec.key(),
            spec: ArcSwap::from_pointee(spec),
            backend: ArcSwap::new(backend),
            chain: MiddlewareChain::new(),
            stats: RoundTripCounters::new(),
        }
    }

    pub fn key(&self) -> &FrontendKey {
        &self.key
    }

    pub fn spec(&self) -> Arc<Frontend> {
        self.spec.load_full()
    }

    pub(crate) fn set_spec(&self, spec: Frontend) {
        self.spec.store(Arc::new(spec));
    }

    pub fn backend(&self) -> Arc<BackendPool> {
        self.backend.load_full()
    }

    pub(crate) fn set_backend(&self, backend: Arc<BackendPool>) {
        self.backend.store(backend);
    }

    pub fn chain(&self) -> &MiddlewareChain {
        &self.chain
    }

    pub fn record(&self, outcome: Outcome, latency: Duration) {
        self.stats.record(outcome, latency);
    }

    pub fn stats(&self) -> RoundTripStats {
        self.stats.snapshot()
    }
}
