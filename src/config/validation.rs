//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (buffers > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "json"];

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn has_port(address: &str) -> bool {
    address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field, message: String| errors.push(ValidationError { field, message });

    if config.listener.enabled {
        if config.listener.id.is_empty() || config.listener.id.contains('/') {
            fail("listener.id", format!("'{}' is not a valid id", config.listener.id));
        }
        if !has_port(&config.listener.bind_address) {
            fail(
                "listener.bind_address",
                format!("'{}' must be host:port", config.listener.bind_address),
            );
        }
    }

    let prefix = config.store.prefix.trim_end_matches('/');
    if !config.store.prefix.starts_with('/') || prefix.is_empty() {
        fail(
            "store.prefix",
            format!("'{}' must start with '/' and name a directory", config.store.prefix),
        );
    }

    if config.supervisor.retry_period_secs == 0 {
        fail("supervisor.retry_period_secs", "must be greater than 0".into());
    }
    if config.supervisor.max_restart_attempts == 0 {
        fail("supervisor.max_restart_attempts", "must be greater than 0".into());
    }
    if config.supervisor.changes_buffer == 0 {
        fail("supervisor.changes_buffer", "must be greater than 0".into());
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        fail(
            "observability.log_level",
            format!("'{}' is not one of {}", config.observability.log_level, LOG_LEVELS.join(", ")),
        );
    }
    if !LOG_FORMATS.contains(&config.observability.log_format.as_str()) {
        fail(
            "observability.log_format",
            format!("'{}' is not one of {}", config.observability.log_format, LOG_FORMATS.join(", ")),
        );
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        fail(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
