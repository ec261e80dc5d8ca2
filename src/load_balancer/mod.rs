//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Frontend matched → backend pool identified
//!     → pool.rs (current servers + upstream client)
//!     → round_robin.rs (rotate through servers)
//!     → upstream.rs (in-flight guard, round-trip stats)
//!     → Return selection or 503 when the pool is empty
//! ```
//!
//! # Design Decisions
//! - The balancer is stateless apart from its counter; pools own servers
//! - Pool state is swapped whole, so a request sees one consistent server
//!   list and client
//! - Server stats live on the `Upstream` and move with it across upserts

use std::sync::Arc;

pub mod pool;
pub mod round_robin;
pub mod upstream;

pub use pool::{BackendPool, Selection, UpstreamClient};
pub use upstream::{Upstream, UpstreamGuard};

/// Server selection strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(&self, servers: &[Arc<Upstream>]) -> Option<Arc<Upstream>>;
}
