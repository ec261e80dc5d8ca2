//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! http::server, middleware, supervisor
//!     → logging.rs (tracing events with server / frontend / request_id fields)
//!     → metrics.rs (request, rejection, change-event and restart counters)
//!
//! Exposed as:
//!     → stdout (pretty or JSON lines)
//!     → optional Prometheus listener
//! ```
//!
//! # Design Decisions
//! - Log format and level come from the process config, `RUST_LOG` overrides
//! - Per-entity round-trip stats live in `proxy::stats`, not here; metrics
//!   are process-wide aggregates only

pub mod logging;
pub mod metrics;
