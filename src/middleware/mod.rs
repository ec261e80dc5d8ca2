//! Per-frontend middleware.
//!
//! # Data Flow
//! ```text
//! Request matched to a frontend:
//!     → chain.rs (capture the current ordered entry list)
//!     → Middleware::process_request, lowest priority first
//!         Some(response) → stop, unwind admitted middlewares
//!     → Middleware::rewrite_request, same order (URI edits)
//!     → forward to upstream
//!     → Middleware::process_response, highest priority first
//!
//! Configuration:
//!     (type, JSON) → registry.rs (factory by type name) → Arc<dyn Middleware>
//!
//! Built-in types: ratelimit.rs, connlimit.rs, rewrite.rs, cbreaker.rs
//! ```
//!
//! # Design Decisions
//! - Chains are swapped whole; a request keeps the chain it started with
//! - `process_response` runs exactly once for every middleware whose
//!   `process_request` admitted the request, even if the client goes away
//! - New middleware types plug in through `MiddlewareFactory`

use std::fmt;
use std::sync::Arc;

use axum::http::request::Parts;
use axum::response::Response;

use crate::error::Result;
use crate::http::request::RequestContext;
use crate::proxy::stats::Outcome;

pub mod cbreaker;
pub mod chain;
pub mod condition;
pub mod connlimit;
pub mod ratelimit;
pub mod registry;
pub mod rewrite;

pub use chain::{ChainEntry, MiddlewareChain, Pipeline};
pub use registry::MiddlewareRegistry;

/// A request/response interceptor bound to a frontend.
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Inspect a request before it is forwarded.
    ///
    /// `Ok(None)` lets it through, `Ok(Some(response))` answers it directly,
    /// an error fails it with the error's status.
    fn process_request(&self, ctx: &RequestContext) -> Result<Option<Response>>;

    /// Edit the request about to be forwarded. Only called when no
    /// middleware answered it.
    fn rewrite_request(&self, _ctx: &RequestContext, _parts: &mut Parts) -> Result<()> {
        Ok(())
    }

    /// Called once the request completed. `outcome` is `None` when it was
    /// abandoned before a response existed.
    fn process_response(&self, _ctx: &RequestContext, _outcome: Option<Outcome>) {}
}

/// Builds middleware instances of one type from their JSON settings.
pub trait MiddlewareFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    fn build(&self, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>>;
}
