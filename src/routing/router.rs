//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Store compiled routes keyed by their canonical expression
//! - Look up the matching target for a request
//! - Return matched target or explicit no-match
//!
//! # Design Decisions
//! - Published table is immutable; writers build a copy and swap it in
//! - Writers are serialised by a mutex, readers never take it
//! - Lookup cost follows path length, not route count
//! - Explicit `None` on no match rather than a silent default

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use axum::http::Method;

use super::expr::{self, RoutePattern};
use super::matcher::RequestView;
use super::trie::{Leaf, TrieNode};
use crate::error::{ProxyError, Result};

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch<T> {
    pub target: T,
    /// Canonical expression of the matched route.
    pub route: Arc<str>,
    /// Captured path parameters in path order.
    pub params: Vec<(String, String)>,
}

impl<T> RouteMatch<T> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

struct RouteEntry<T> {
    key: Arc<str>,
    pattern: RoutePattern,
    leaf: Arc<Leaf<T>>,
}

impl<T> Clone for RouteEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            pattern: self.pattern.clone(),
            leaf: Arc::clone(&self.leaf),
        }
    }
}

struct RouteTable<T> {
    entries: Vec<RouteEntry<T>>,
    root: Option<Arc<TrieNode<T>>>,
}

impl<T> RouteTable<T> {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            root: None,
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| &*e.key == key)
    }

    fn with_entry(&self, entry: RouteEntry<T>) -> Self {
        let branch = TrieNode::branch(&entry.pattern, Arc::clone(&entry.leaf));
        let root = match &self.root {
            Some(root) => root.merge(&branch),
            None => branch,
        };
        let mut entries = self.entries.clone();
        entries.push(entry);
        Self {
            entries,
            root: Some(Arc::new(root)),
        }
    }

    /// Rebuild from scratch, preserving registration order.
    fn from_entries(entries: Vec<RouteEntry<T>>) -> Self {
        let root = entries.iter().fold(None::<TrieNode<T>>, |acc, entry| {
            let branch = TrieNode::branch(&entry.pattern, Arc::clone(&entry.leaf));
            Some(match acc {
                Some(root) => root.merge(&branch),
                None => branch,
            })
        });
        Self {
            entries,
            root: root.map(Arc::new),
        }
    }
}

/// Copy-on-write trie router mapping route expressions to targets.
pub struct Router<T> {
    table: ArcSwap<RouteTable<T>>,
    write: Mutex<()>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Router<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.table.load().entries.len())
            .finish()
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::empty()),
            write: Mutex::new(()),
        }
    }

    /// Compile `expr` and merge it into the trie.
    ///
    /// Fails on a syntax error or when an equivalent expression is already
    /// registered; the published trie is untouched in both cases.
    pub fn add_route(&self, expr: &str, target: T) -> Result<()> {
        let pattern = expr::parse(expr)?;
        let key: Arc<str> = Arc::from(pattern.canonical());

        let _guard = self.write.lock().expect("router mutex poisoned");
        let current = self.table.load_full();
        if current.position(&key).is_some() {
            return Err(ProxyError::AlreadyExists(format!("route {}", expr)));
        }
        let leaf = Arc::new(Leaf::new(Arc::clone(&key), &pattern, target));
        let next = current.with_entry(RouteEntry { key, pattern, leaf });
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// Remove the route registered under `expr`. Returns false if absent.
    pub fn remove_route(&self, expr: &str) -> bool {
        let Ok(pattern) = expr::parse(expr) else {
            return false;
        };
        let key = pattern.canonical();

        let _guard = self.write.lock().expect("router mutex poisoned");
        let current = self.table.load_full();
        let Some(index) = current.position(&key) else {
            return false;
        };
        let mut entries = current.entries.clone();
        entries.remove(index);
        self.table.store(Arc::new(RouteTable::from_entries(entries)));
        true
    }

    /// Atomically swap the route at `old` for `new`, keeping its position.
    ///
    /// Readers see either the old route or the new one, never neither.
    /// `old` need not be registered; then this behaves like `add_route`.
    pub fn replace_route(&self, old: &str, new: &str, target: T) -> Result<()> {
        let pattern = expr::parse(new)?;
        let key: Arc<str> = Arc::from(pattern.canonical());
        let old_key = expr::parse(old).ok().map(|p| p.canonical());

        let _guard = self.write.lock().expect("router mutex poisoned");
        let current = self.table.load_full();
        let old_index = old_key.as_deref().and_then(|k| current.position(k));
        if let Some(existing) = current.position(&key) {
            if Some(existing) != old_index {
                return Err(ProxyError::AlreadyExists(format!("route {}", new)));
            }
        }

        let leaf = Arc::new(Leaf::new(Arc::clone(&key), &pattern, target));
        let entry = RouteEntry { key, pattern, leaf };
        let mut entries = current.entries.clone();
        match old_index {
            Some(index) => entries[index] = entry,
            None => entries.push(entry),
        }
        self.table.store(Arc::new(RouteTable::from_entries(entries)));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Router<T> {
    /// Resolve a request. An empty path is treated as `/`.
    pub fn route(&self, method: &Method, host: Option<&str>, path: &str) -> Option<RouteMatch<T>> {
        let table = self.table.load();
        let root = table.root.as_ref()?;
        let path = if path.is_empty() { "/" } else { path };
        let req = RequestView { method, host };
        let mut params = Vec::new();
        root.find(path.as_bytes(), 0, &req, &mut params)
            .map(|leaf| RouteMatch {
                target: leaf.target.clone(),
                route: Arc::clone(&leaf.route),
                params,
            })
    }
}
