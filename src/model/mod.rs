//! Configuration entities as stored under the key prefix.
//!
//! # Design Decisions
//! - Identifiers live in the key path; an `id` inside the JSON is optional
//!   and overwritten by the key when decoded from the store
//! - `validate()` checks everything that can be checked without live state,
//!   so an invalid entity never reaches the apply layer

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::routing::expr;

pub mod events;
pub mod snapshot;

pub use events::ChangeEvent;
pub use snapshot::{BackendSpec, FrontendSpec, Snapshot};

pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_HTTPS: &str = "https";
pub const NETWORK_TCP: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerKey {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendKey {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrontendKey {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub backend_key: BackendKey,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MiddlewareKey {
    pub frontend_key: FrontendKey,
    pub id: String,
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Display for FrontendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.backend_key, self.id)
    }
}

impl fmt::Display for MiddlewareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.frontend_key, self.id)
    }
}

impl BackendKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl FrontendKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ProxyError::InvalidFormat(format!("{} id can not be empty", kind)));
    }
    if id.contains('/') {
        return Err(ProxyError::InvalidFormat(format!("{} id '{}' contains '/'", kind, id)));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub name: String,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn key(&self) -> HostKey {
        HostKey {
            name: self.name.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("host", &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default = "default_network")]
    pub network: String,
    pub address: String,
}

fn default_network() -> String {
    NETWORK_TCP.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub address: Address,
}

fn default_protocol() -> String {
    PROTOCOL_HTTP.to_string()
}

impl Listener {
    pub fn http(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: default_protocol(),
            address: Address {
                network: default_network(),
                address: address.into(),
            },
        }
    }

    pub fn key(&self) -> ListenerKey {
        ListenerKey { id: self.id.clone() }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("listener", &self.id)?;
        match self.protocol.to_ascii_lowercase().as_str() {
            PROTOCOL_HTTP => {}
            PROTOCOL_HTTPS => {
                return Err(ProxyError::InvalidFormat(format!(
                    "listener {}: https listeners are not supported",
                    self.id
                )))
            }
            other => {
                return Err(ProxyError::InvalidFormat(format!(
                    "listener {}: unsupported protocol '{}'",
                    self.id, other
                )))
            }
        }
        if !self.address.network.eq_ignore_ascii_case(NETWORK_TCP) {
            return Err(ProxyError::InvalidFormat(format!(
                "listener {}: unsupported network '{}'",
                self.id, self.address.network
            )));
        }
        if self.address.address.is_empty() || !self.address.address.contains(':') {
            return Err(ProxyError::InvalidFormat(format!(
                "listener {}: address '{}' must be host:port",
                self.id, self.address.address
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendTimeouts {
    /// Time to wait for response headers. Zero disables.
    pub read_ms: u64,
    /// Connect timeout. Zero disables.
    pub dial_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAlive {
    pub idle_ms: u64,
    pub max_idle_per_host: usize,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            idle_ms: 90_000,
            max_idle_per_host: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub timeouts: BackendTimeouts,
    pub keep_alive: KeepAlive,
}

impl BackendSettings {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.timeouts.read_ms > 0).then(|| Duration::from_millis(self.timeouts.read_ms))
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.timeouts.dial_ms > 0).then(|| Duration::from_millis(self.timeouts.dial_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.keep_alive.idle_ms > 0).then(|| Duration::from_millis(self.keep_alive.idle_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub settings: BackendSettings,
}

impl Backend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            settings: BackendSettings::default(),
        }
    }

    pub fn key(&self) -> BackendKey {
        BackendKey::new(self.id.clone())
    }

    pub fn validate(&self) -> Result<()> {
        require_id("backend", &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    pub url: String,
}

impl Server {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("server", &self.id)?;
        self.parsed_url().map(|_| ())
    }

    pub fn parsed_url(&self) -> Result<url::Url> {
        let invalid = || ProxyError::InvalidFormat(format!("server url '{}' is not valid", self.url));
        let parsed = url::Url::parse(&self.url).map_err(|_| invalid())?;
        if parsed.scheme() != "http" || parsed.host_str().is_none() {
            return Err(invalid());
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendLimits {
    /// Largest accepted request body. Zero means unlimited.
    pub max_body_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendSettings {
    /// Forward the client's `Host` header instead of the upstream's.
    pub pass_host_header: bool,
    /// Append to incoming `X-Forwarded-*` headers instead of replacing them.
    pub trust_forward_header: bool,
    pub limits: FrontendLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    #[serde(default)]
    pub id: String,
    pub route: String,
    pub backend_id: String,
    #[serde(default)]
    pub settings: FrontendSettings,
}

impl Frontend {
    pub fn new(id: impl Into<String>, backend_id: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            route: route.into(),
            backend_id: backend_id.into(),
            settings: FrontendSettings::default(),
        }
    }

    pub fn key(&self) -> FrontendKey {
        FrontendKey::new(self.id.clone())
    }

    pub fn backend_key(&self) -> BackendKey {
        BackendKey::new(self.backend_id.clone())
    }

    pub fn validate(&self) -> Result<()> {
        require_id("frontend", &self.id)?;
        require_id("backend", &self.backend_id)?;
        expr::parse(&self.route)?;
        Ok(())
    }
}

/// Stored form of a middleware bound to a frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific settings handed to the factory.
    pub middleware: serde_json::Value,
}

impl MiddlewareSpec {
    pub fn new(id: impl Into<String>, priority: i32, kind: impl Into<String>, middleware: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            priority,
            kind: kind.into(),
            middleware,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("middleware", &self.id)?;
        if self.kind.is_empty() {
            return Err(ProxyError::InvalidFormat(format!(
                "middleware {} has no type",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frontend_route_is_validated() {
        let ok = Frontend::new("f1", "b1", r#"Path("/")"#);
        assert!(ok.validate().is_ok());
        let bad = Frontend::new("f1", "b1", "Path(");
        assert!(matches!(bad.validate(), Err(ProxyError::Syntax { .. })));
        let no_backend = Frontend::new("f1", "", r#"Path("/")"#);
        assert!(matches!(no_backend.validate(), Err(ProxyError::InvalidFormat(_))));
    }

    #[test]
    fn server_url_is_validated() {
        assert!(Server::new("s1", "http://127.0.0.1:5000").validate().is_ok());
        assert!(Server::new("s1", "127.0.0.1:5000").validate().is_err());
        assert!(Server::new("s1", "ftp://host").validate().is_err());
        assert!(Server::new("", "http://host").validate().is_err());
    }

    #[test]
    fn listener_protocols() {
        assert!(Listener::http("l1", "127.0.0.1:8080").validate().is_ok());
        let mut https = Listener::http("l1", "127.0.0.1:8443");
        https.protocol = "https".into();
        assert!(https.validate().is_err());
        assert!(Listener::http("l1", "nowhere").validate().is_err());
    }

    #[test]
    fn decodes_with_defaults() {
        let f: Frontend = serde_json::from_value(json!({
            "route": "Path(`/`)",
            "backend_id": "b1"
        }))
        .unwrap();
        assert_eq!(f.settings, FrontendSettings::default());

        let b: Backend = serde_json::from_value(json!({
            "settings": {"timeouts": {"read_ms": 250}}
        }))
        .unwrap();
        assert_eq!(b.settings.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(b.settings.dial_timeout(), None);
        assert_eq!(b.settings.keep_alive, KeepAlive::default());

        let m: MiddlewareSpec = serde_json::from_value(json!({
            "priority": 1,
            "type": "ratelimit",
            "middleware": {"requests": 10}
        }))
        .unwrap();
        assert_eq!(m.kind, "ratelimit");
    }
}
