//! Middleware factories keyed by type name.

use std::collections::HashMap;
use std::sync::Arc;

use super::cbreaker::CircuitBreakerFactory;
use super::connlimit::ConnLimitFactory;
use super::ratelimit::RateLimitFactory;
use super::rewrite::RewriteFactory;
use super::{Middleware, MiddlewareFactory};
use crate::error::{ProxyError, Result};

#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    factories: HashMap<&'static str, Arc<dyn MiddlewareFactory>>,
}

impl std::fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            super::ratelimit::KIND,
            Arc::new(RateLimitFactory::default()),
        );
        registry
            .factories
            .insert(super::connlimit::KIND, Arc::new(ConnLimitFactory));
        registry
            .factories
            .insert(super::rewrite::KIND, Arc::new(RewriteFactory));
        registry.factories.insert(
            super::cbreaker::KIND,
            Arc::new(CircuitBreakerFactory::default()),
        );
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn MiddlewareFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(kind) {
            return Err(ProxyError::AlreadyExists(format!("middleware type {}", kind)));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Swap in a factory for an existing type, e.g. to inject a test clock.
    pub fn replace(&mut self, factory: Arc<dyn MiddlewareFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, kind: &str, settings: &serde_json::Value) -> Result<Arc<dyn Middleware>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ProxyError::NotFound(format!("middleware type {}", kind)))?;
        factory.build(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_registered() {
        let registry = MiddlewareRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec!["cbreaker", "connlimit", "ratelimit", "rewrite"]
        );
        assert!(registry.build("ratelimit", &json!({"requests": 5})).is_ok());
        assert!(registry
            .build("rewrite", &json!({"regexp": "^/a", "replacement": "/b"}))
            .is_ok());
        assert!(registry
            .build("cbreaker", &json!({"condition": "FailureRatio() > 0.5"}))
            .is_ok());
    }

    #[test]
    fn unknown_kind() {
        let registry = MiddlewareRegistry::with_defaults();
        assert!(matches!(
            registry.build("gzip", &json!({})),
            Err(ProxyError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_registration() {
        let mut registry = MiddlewareRegistry::with_defaults();
        assert!(registry.register(Arc::new(ConnLimitFactory)).is_err());
        registry.replace(Arc::new(ConnLimitFactory));
        assert!(registry.contains("connlimit"));
    }
}
