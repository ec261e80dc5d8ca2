//! Process configuration subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → main wires it into logging, metrics, store, supervisor
//! ```
//!
//! # Design Decisions
//! - Only process-level settings live here; routing, backends and limits
//!   are live data in the configuration store
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    ListenerConfig, ObservabilityConfig, ProxyConfig, StoreConfig, SupervisorConfig,
    TimeoutConfig,
};
