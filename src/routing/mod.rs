//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route registration (frontend upsert):
//!     expression string
//!     → expr.rs (compile to RoutePattern)
//!     → trie.rs (single-branch trie, merged into a copy of the live trie)
//!     → router.rs (atomic swap of the published table)
//!
//! Incoming Request (method, host, path)
//!     → router.rs (lock-free load of the current table)
//!     → trie.rs (depth-first walk, children in insertion order)
//!     → matcher.rs (method/host filters on candidate leaves)
//!     → Return: target + captured params, or no match
//! ```
//!
//! # Design Decisions
//! - Routes mutate at runtime; readers never see a half-built trie
//! - No regex in hot path
//! - The first registered route that matches wins

pub mod expr;
pub mod matcher;
pub mod router;
mod trie;

pub use expr::{RoutePattern, RouteSyntaxError};
pub use router::{RouteMatch, Router};
