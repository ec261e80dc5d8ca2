//! Configuration schema definitions.
//!
//! This module defines the process configuration of the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Listener;
use crate::proxy::ServerOptions;
use crate::supervisor::SupervisorOptions;

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener registered in every server before the stored ones.
    pub listener: ListenerConfig,

    /// Configuration store settings.
    pub store: StoreConfig,

    /// Hot restart behaviour.
    pub supervisor: SupervisorConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            default_listener: self.listener.to_listener(),
            drain_timeout: Duration::from_secs(self.timeouts.drain_secs),
            request_timeout: (self.timeouts.request_secs > 0)
                .then(|| Duration::from_secs(self.timeouts.request_secs)),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            retry_period: Duration::from_secs(self.supervisor.retry_period_secs),
            max_restart_attempts: self.supervisor.max_restart_attempts,
            changes_buffer: self.supervisor.changes_buffer,
        }
    }
}

/// Default listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Register the default listener at all.
    pub enabled: bool,

    /// Listener id; a stored listener with the same id replaces it.
    pub id: String,

    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            id: "default".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ListenerConfig {
    pub fn to_listener(&self) -> Option<Listener> {
        self.enabled
            .then(|| Listener::http(self.id.clone(), self.bind_address.clone()))
    }
}

/// Configuration store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key prefix every entity lives under.
    pub prefix: String,

    /// JSON object of `relative key -> entity` loaded into the store at
    /// startup.
    pub seed_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "/hotwire".to_string(),
            seed_file: None,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Pause between failed restart attempts in seconds.
    pub retry_period_secs: u64,

    /// Consecutive failed restarts before the process gives up.
    pub max_restart_attempts: u32,

    /// Capacity of the change queue between feed reader and applier.
    pub changes_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_period_secs: 5,
            max_restart_attempts: 10,
            changes_buffer: 2000,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout in seconds. Zero disables.
    pub request_secs: u64,

    /// Longest graceful drain in seconds before connections are aborted.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 0,
            drain_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output: "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.prefix, "/hotwire");
        assert_eq!(config.supervisor.changes_buffer, 2000);
        let options = config.server_options();
        assert_eq!(options.default_listener.unwrap().address.address, "0.0.0.0:8080");
        assert_eq!(options.request_timeout, None);
    }

    #[test]
    fn sections_override_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [listener]
            enabled = false

            [store]
            prefix = "/edge"
            seed_file = "seed.json"

            [supervisor]
            retry_period_secs = 1

            [timeouts]
            request_secs = 15
            "#,
        )
        .unwrap();
        assert!(config.server_options().default_listener.is_none());
        assert_eq!(config.store.seed_file, Some(PathBuf::from("seed.json")));
        assert_eq!(config.supervisor_options().retry_period, Duration::from_secs(1));
        assert_eq!(config.server_options().request_timeout, Some(Duration::from_secs(15)));
    }
}
