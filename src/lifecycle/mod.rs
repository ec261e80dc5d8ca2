//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     first SIGTERM/SIGINT  → Shutdown::trigger (graceful)
//!     second SIGTERM/SIGINT → Shutdown::force
//!
//! Shutdown (shutdown.rs):
//!     graceful → supervisor.stop(true): stop accepting, drain, close
//!     forced   → supervisor.stop(false): abort in-flight requests
//! ```
//!
//! # Design Decisions
//! - Shutdown is a pair of cancellation tokens any task can await
//! - Forced implies graceful, so waiters on either wake
//! - Draining has a deadline, after which connections are aborted

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
