//! Hotwire: a reverse proxy driven by a live configuration store.

pub mod config;
pub mod error;
pub mod feed;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod middleware;
pub mod model;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod routing;
pub mod security;
pub mod store;
pub mod supervisor;

pub use config::schema::ProxyConfig;
pub use error::{ProxyError, Result};
pub use feed::ChangeFeed;
pub use lifecycle::Shutdown;
pub use proxy::ProxyServer;
pub use store::{ConfigStore, MemoryStore};
pub use supervisor::Supervisor;
