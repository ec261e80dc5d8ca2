//! Error taxonomy shared by every subsystem.
//!
//! # Design Decisions
//! - Validation errors (`Syntax`, `InvalidFormat`, `NotFound`, `AlreadyExists`,
//!   `Conflict`) are returned before any live structure is touched
//! - `Feed` is transient: the supervisor answers it with a hot restart
//! - A limiter rejection is not an error; it is a rendered 429 response
//! - Every variant knows the HTTP status it renders as on the request path

use axum::http::StatusCode;

use crate::routing::expr::RouteSyntaxError;

/// Result alias used across the crate.
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProxyError {
    /// Malformed route or middleware expression, never stored.
    #[error("syntax error in '{input}': {reason}")]
    Syntax { input: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Missing or malformed identifier or attribute.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Operation blocked by a live reference.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connectivity loss to the configuration store.
    #[error("change feed error: {0}")]
    Feed(String),

    /// The request asks for more tokens than the bucket can ever hold.
    #[error("requested {requested} tokens, bucket holds at most {max}")]
    TokensExceedBurst { requested: u64, max: u64 },

    /// A request could not be mapped to a limiter token.
    #[error("failed to map request: {0}")]
    Mapping(String),

    #[error("failed to decode '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unrecoverable supervisor failure.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProxyError {
    pub fn syntax(input: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::Syntax {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Status used when this error terminates a proxied request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Syntax { .. }
            | ProxyError::InvalidFormat(_)
            | ProxyError::Mapping(_)
            | ProxyError::Decode { .. } => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::AlreadyExists(_) | ProxyError::Conflict(_) => StatusCode::CONFLICT,
            ProxyError::TokensExceedBurst { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Feed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Io(_) | ProxyError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RouteSyntaxError> for ProxyError {
    fn from(err: RouteSyntaxError) -> Self {
        ProxyError::Syntax {
            input: err.expr,
            reason: err.reason,
        }
    }
}
