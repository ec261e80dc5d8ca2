//! Ordered, hot-swappable middleware chain.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use axum::http::request::Parts;
use axum::response::Response;

use super::Middleware;
use crate::error::{ProxyError, Result};
use crate::http::request::RequestContext;
use crate::proxy::stats::Outcome;

#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub id: String,
    pub priority: i32,
    pub kind: String,
    pub middleware: Arc<dyn Middleware>,
}

/// Middlewares of one frontend, ordered by `(priority, id)`.
#[derive(Debug)]
pub struct MiddlewareChain {
    entries: ArcSwap<Vec<ChainEntry>>,
    write: Mutex<()>,
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            write: Mutex::new(()),
        }
    }

    /// Insert a new middleware. Fails if the id is taken.
    pub fn add(&self, entry: ChainEntry) -> Result<()> {
        self.modify(|entries| {
            if entries.iter().any(|e| e.id == entry.id) {
                return Err(ProxyError::AlreadyExists(format!("middleware {}", entry.id)));
            }
            entries.push(entry);
            Ok(())
        })
    }

    /// Replace an existing middleware. Fails if the id is unknown.
    pub fn update(&self, entry: ChainEntry) -> Result<()> {
        self.modify(|entries| {
            let slot = entries
                .iter_mut()
                .find(|e| e.id == entry.id)
                .ok_or_else(|| ProxyError::NotFound(format!("middleware {}", entry.id)))?;
            *slot = entry;
            Ok(())
        })
    }

    /// Insert or replace. Never fails, the id is the only constraint.
    pub fn upsert(&self, entry: ChainEntry) {
        let _guard = self.write.lock().expect("middleware chain mutex poisoned");
        let mut entries = Vec::clone(&self.entries.load());
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => entries.push(entry),
        }
        self.publish(entries);
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.modify(|entries| {
            let index = entries
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| ProxyError::NotFound(format!("middleware {}", id)))?;
            entries.remove(index);
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Option<ChainEntry> {
        self.entries.load().iter().find(|e| e.id == id).cloned()
    }

    /// The chain as published right now.
    pub fn snapshot(&self) -> Arc<Vec<ChainEntry>> {
        self.entries.load_full()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.load().iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Edits a private copy and publishes it only on success.
    fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<ChainEntry>) -> Result<()>,
    {
        let _guard = self.write.lock().expect("middleware chain mutex poisoned");
        let mut entries = Vec::clone(&self.entries.load());
        f(&mut entries)?;
        self.publish(entries);
        Ok(())
    }

    // Caller holds the write lock.
    fn publish(&self, mut entries: Vec<ChainEntry>) {
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        self.entries.store(Arc::new(entries));
    }
}

/// One request's pass through a captured chain.
///
/// Dropping the pipeline calls `process_response` on every admitted
/// middleware in reverse order, so completion, early rejection and client
/// disconnect all release what was acquired.
pub struct Pipeline {
    entries: Arc<Vec<ChainEntry>>,
    ctx: Arc<RequestContext>,
    admitted: usize,
    outcome: Option<Outcome>,
}

impl Pipeline {
    pub fn new(chain: &MiddlewareChain, ctx: Arc<RequestContext>) -> Self {
        Self {
            entries: chain.snapshot(),
            ctx,
            admitted: 0,
            outcome: None,
        }
    }

    /// Run `process_request` in order. Returns the first short-circuit
    /// response, if any.
    pub fn process_request(&mut self) -> Result<Option<Response>> {
        while self.admitted < self.entries.len() {
            let entry = &self.entries[self.admitted];
            match entry.middleware.process_request(&self.ctx)? {
                Some(response) => {
                    tracing::debug!(
                        request_id = %self.ctx.request_id,
                        middleware = %entry.id,
                        status = %response.status(),
                        "Middleware answered request"
                    );
                    self.outcome = Some(Outcome::Status(response.status()));
                    return Ok(Some(response));
                }
                None => self.admitted += 1,
            }
        }
        Ok(None)
    }

    /// Let every admitted middleware edit the outgoing request, in chain
    /// order.
    pub fn rewrite_request(&self, parts: &mut Parts) -> Result<()> {
        for entry in &self.entries[..self.admitted] {
            entry.middleware.rewrite_request(&self.ctx, parts)?;
        }
        Ok(())
    }

    /// Record how the round trip ended.
    pub fn complete(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for entry in self.entries[..self.admitted].iter().rev() {
            entry.middleware.process_response(&self.ctx, self.outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        reject: bool,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn process_request(&self, _ctx: &RequestContext) -> Result<Option<Response>> {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            if self.reject {
                let mut response = Response::new(axum::body::Body::empty());
                *response.status_mut() = StatusCode::FORBIDDEN;
                return Ok(Some(response));
            }
            Ok(None)
        }

        fn rewrite_request(&self, _ctx: &RequestContext, parts: &mut Parts) -> Result<()> {
            let path = format!("/{}{}", self.name, parts.uri.path());
            parts.uri = path.parse().unwrap();
            Ok(())
        }

        fn process_response(&self, _ctx: &RequestContext, outcome: Option<Outcome>) {
            let status = outcome.map(|o| match o {
                Outcome::Status(s) => s.as_u16(),
                Outcome::NetworkError => 0,
            });
            self.log
                .lock()
                .unwrap()
                .push(format!("resp:{}:{:?}", self.name, status));
        }
    }

    fn entry(id: &str, priority: i32, reject: bool, log: &Arc<StdMutex<Vec<String>>>) -> ChainEntry {
        let name: &'static str = Box::leak(id.to_string().into_boxed_str());
        ChainEntry {
            id: id.to_string(),
            priority,
            kind: "recorder".into(),
            middleware: Arc::new(Recorder {
                name,
                reject,
                log: log.clone(),
            }),
        }
    }

    fn ctx() -> Arc<RequestContext> {
        Arc::new(RequestContext::for_test("1.2.3.4:1", "a.com"))
    }

    #[test]
    fn ordered_by_priority_then_id() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("b", 1, false, &log)).unwrap();
        chain.add(entry("z", 0, false, &log)).unwrap();
        chain.add(entry("a", 1, false, &log)).unwrap();
        assert_eq!(chain.ids(), vec!["z", "a", "b"]);
    }

    #[test]
    fn add_update_remove() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("m", 0, false, &log)).unwrap();
        assert!(matches!(
            chain.add(entry("m", 1, false, &log)),
            Err(ProxyError::AlreadyExists(_))
        ));
        assert!(matches!(
            chain.update(entry("x", 1, false, &log)),
            Err(ProxyError::NotFound(_))
        ));
        chain.update(entry("m", 5, false, &log)).unwrap();
        assert_eq!(chain.get("m").unwrap().priority, 5);
        chain.upsert(entry("n", 1, false, &log));
        assert_eq!(chain.ids(), vec!["n", "m"]);
        chain.remove("m").unwrap();
        assert!(chain.remove("m").is_err());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn upsert_replaces_and_reorders() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.upsert(entry("a", 0, false, &log));
        chain.upsert(entry("b", 1, false, &log));
        assert_eq!(chain.ids(), vec!["a", "b"]);

        chain.upsert(entry("a", 2, true, &log));
        assert_eq!(chain.ids(), vec!["b", "a"]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get("a").unwrap().priority, 2);

        let mut pipeline = Pipeline::new(&chain, ctx());
        let response = pipeline.process_request().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn pipeline_unwinds_in_reverse() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("first", 0, false, &log)).unwrap();
        chain.add(entry("second", 1, false, &log)).unwrap();

        let mut pipeline = Pipeline::new(&chain, ctx());
        assert!(pipeline.process_request().unwrap().is_none());
        pipeline.complete(Outcome::Status(StatusCode::OK));
        drop(pipeline);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "req:first",
                "req:second",
                "resp:second:Some(200)",
                "resp:first:Some(200)"
            ]
        );
    }

    #[test]
    fn rejection_unwinds_only_admitted() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("outer", 0, false, &log)).unwrap();
        chain.add(entry("gate", 1, true, &log)).unwrap();
        chain.add(entry("inner", 2, false, &log)).unwrap();

        let mut pipeline = Pipeline::new(&chain, ctx());
        let response = pipeline.process_request().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        drop(pipeline);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["req:outer", "req:gate", "resp:outer:Some(403)"]
        );
    }

    #[test]
    fn rewrites_apply_in_chain_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("outer", 0, false, &log)).unwrap();
        chain.add(entry("inner", 1, false, &log)).unwrap();

        let mut pipeline = Pipeline::new(&chain, ctx());
        assert!(pipeline.process_request().unwrap().is_none());
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/x")
            .body(())
            .unwrap()
            .into_parts();
        pipeline.rewrite_request(&mut parts).unwrap();
        assert_eq!(parts.uri.path(), "/inner/outer/x");

        pipeline.complete(Outcome::NetworkError);
        drop(pipeline);
        assert_eq!(log.lock().unwrap()[2], "resp:inner:Some(0)");
    }

    #[test]
    fn captured_chain_survives_swap() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let chain = MiddlewareChain::new();
        chain.add(entry("old", 0, false, &log)).unwrap();

        let mut pipeline = Pipeline::new(&chain, ctx());
        chain.remove("old").unwrap();
        chain.add(entry("new", 0, false, &log)).unwrap();
        pipeline.process_request().unwrap();
        drop(pipeline);

        assert_eq!(*log.lock().unwrap(), vec!["req:old", "resp:old:None"]);
    }
}
