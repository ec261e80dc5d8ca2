//! Request → limiter token mapping.
//!
//! A mapper turns a request into the string key limiters account under,
//! plus the amount to charge (always 1 for the built-in variables).
//!
//! Supported variables:
//! - `client.ip`: remote peer address without port
//! - `request.host`: request host without port
//! - `request.header.<Name>`: value of a request header

use std::fmt;

use axum::http::HeaderName;

use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::routing::matcher::strip_port;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMapper {
    ClientIp,
    RequestHost,
    Header(HeaderName),
}

impl TokenMapper {
    pub fn parse(variable: &str) -> Result<Self> {
        match variable {
            "client.ip" => Ok(TokenMapper::ClientIp),
            "request.host" => Ok(TokenMapper::RequestHost),
            other => {
                let name = other
                    .strip_prefix("request.header.")
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        ProxyError::InvalidFormat(format!("unsupported limiting variable '{}'", other))
                    })?;
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ProxyError::InvalidFormat(format!("invalid header name '{}'", name))
                })?;
                Ok(TokenMapper::Header(header))
            }
        }
    }

    /// Returns `(token, amount)` or a mapping error when the request lacks
    /// the source value.
    pub fn map(&self, ctx: &RequestContext) -> Result<(String, u64)> {
        let token = match self {
            TokenMapper::ClientIp => ctx
                .client_addr
                .map(|addr| addr.ip().to_string())
                .ok_or_else(|| ProxyError::Mapping("client address is unknown".into()))?,
            TokenMapper::RequestHost => ctx
                .host()
                .map(|h| strip_port(h).to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ProxyError::Mapping("request has no host".into()))?,
            TokenMapper::Header(name) => ctx
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ProxyError::Mapping(format!("header '{}' is missing", name)))?,
        };
        Ok((token, 1))
    }
}

impl fmt::Display for TokenMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenMapper::ClientIp => f.write_str("client.ip"),
            TokenMapper::RequestHost => f.write_str("request.host"),
            TokenMapper::Header(name) => write!(f, "request.header.{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_variables() {
        assert_eq!(TokenMapper::parse("client.ip").unwrap(), TokenMapper::ClientIp);
        assert_eq!(
            TokenMapper::parse("request.header.X-Api-Key").unwrap().to_string(),
            "request.header.x-api-key"
        );
        assert!(TokenMapper::parse("request.header.").is_err());
        assert!(TokenMapper::parse("request.cookie").is_err());
    }

    #[test]
    fn maps_client_ip_and_host() {
        let ctx = RequestContext::for_test("1.2.3.4:5555", "Example.com:8080");
        assert_eq!(TokenMapper::ClientIp.map(&ctx).unwrap(), ("1.2.3.4".to_string(), 1));
        assert_eq!(
            TokenMapper::RequestHost.map(&ctx).unwrap().0,
            "example.com"
        );
    }

    #[test]
    fn missing_source_is_an_error() {
        let ctx = RequestContext::for_test("not-an-address", "a.com");
        assert!(matches!(
            TokenMapper::ClientIp.map(&ctx),
            Err(ProxyError::Mapping(_))
        ));
        let mapper = TokenMapper::parse("request.header.X-Key").unwrap();
        assert!(mapper.map(&ctx).is_err());
    }
}
