//! Request filters attached to trie leaves.
//!
//! # Responsibilities
//! - Match request method against the set from `Method(...)`
//! - Match request host (exact, case-insensitive, port ignored)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - The path is matched by the trie itself, filters only see method and host
//! - Empty filter set = always matches (wildcard)

use axum::http::Method;

/// The parts of a request a filter may inspect.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub host: Option<&'a str>,
}

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &RequestView<'_>) -> bool;
}

/// Matches the request host, with any `:port` suffix stripped.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        req.host
            .map(strip_port)
            .map(|h| h.eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches any of a set of methods.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<Method>,
}

impl MethodMatcher {
    pub fn new(methods: Vec<Method>) -> Self {
        Self { methods }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        self.methods.iter().any(|m| m == req.method)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}

/// Strip a trailing `:port`, keeping bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(method: &'a Method, host: Option<&'a str>) -> RequestView<'a> {
        RequestView { method, host }
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&view(&Method::GET, Some("example.com"))));
        assert!(matcher.matches(&view(&Method::GET, Some("EXAMPLE.COM:8080"))));
        assert!(!matcher.matches(&view(&Method::GET, Some("other.com"))));
        assert!(!matcher.matches(&view(&Method::GET, None)));
    }

    #[test]
    fn test_method_matcher() {
        let matcher = MethodMatcher::new(vec![Method::GET, Method::POST]);
        assert!(matcher.matches(&view(&Method::POST, None)));
        assert!(!matcher.matches(&view(&Method::DELETE, None)));
    }

    #[test]
    fn test_empty_and_matches_everything() {
        assert!(AndMatcher::default().matches(&view(&Method::PUT, None)));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.com:80"), "a.com");
        assert_eq!(strip_port("a.com"), "a.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
    }
}
