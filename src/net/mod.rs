//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Listener upserted
//!     → listener.rs (bind std socket, non-blocking)
//!     → handed to the HTTP layer as a tokio listener
//!
//! Hot restart:
//!     old server listener_sockets() → dup'd descriptors
//!     → new server adopts them, starts accepting
//!     → old server stops accepting and drains
//!
//! Request served
//!     → connection.rs (in-flight guard held for the request lifetime)
//! ```
//!
//! # Design Decisions
//! - Sockets are bound with std so they can be duplicated before a
//!   runtime listener takes ownership
//! - Duplicated descriptors share one kernel socket: no accept gap while
//!   two servers overlap

pub mod connection;
pub mod listener;

pub use connection::{RequestGuard, RequestTracker};
pub use listener::{BoundListener, ListenerError};
