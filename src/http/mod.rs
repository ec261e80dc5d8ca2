//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::BoundListener)
//!     → server.rs (Axum setup, request id + trace layers)
//!     → request.rs (request id, RequestContext)
//!     → [routing layer picks the frontend]
//!     → [middleware pipeline, then load balancer picks a server]
//!     → response.rs (structured errors for proxy-generated responses)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestContext, X_REQUEST_ID};
pub use server::{build_app, serve};
