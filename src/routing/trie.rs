//! Persistent route trie.
//!
//! Nodes are immutable once built. Merging two tries shares every untouched
//! subtree through `Arc` and only allocates along the merged path, so a
//! published trie is never modified while readers walk it.

use std::sync::Arc;

use super::expr::{PathSegment, RoutePattern};
use super::matcher::{AndMatcher, HostMatcher, Matcher, MethodMatcher, RequestView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeKey {
    Root,
    Char(u8),
    Param(String),
}

impl From<&PathSegment> for NodeKey {
    fn from(segment: &PathSegment) -> Self {
        match segment {
            PathSegment::Char(b) => NodeKey::Char(*b),
            PathSegment::Param(name) => NodeKey::Param(name.clone()),
        }
    }
}

/// A registered target plus the non-path conditions it requires.
#[derive(Debug)]
pub(crate) struct Leaf<T> {
    pub(crate) route: Arc<str>,
    pub(crate) filter: AndMatcher,
    pub(crate) target: T,
}

impl<T> Leaf<T> {
    pub(crate) fn new(route: Arc<str>, pattern: &RoutePattern, target: T) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(methods) = &pattern.methods {
            matchers.push(Box::new(MethodMatcher::new(methods.clone())));
        }
        if let Some(host) = &pattern.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        Self {
            route,
            filter: AndMatcher::new(matchers),
            target,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TrieNode<T> {
    pub(crate) key: NodeKey,
    pub(crate) children: Vec<Arc<TrieNode<T>>>,
    pub(crate) leaves: Vec<Arc<Leaf<T>>>,
}

impl<T> TrieNode<T> {
    /// Build a single-branch trie for one pattern.
    pub(crate) fn branch(pattern: &RoutePattern, leaf: Arc<Leaf<T>>) -> TrieNode<T> {
        let mut node: Option<TrieNode<T>> = None;
        for segment in pattern.path.iter().rev() {
            let (children, leaves) = match node.take() {
                Some(child) => (vec![Arc::new(child)], Vec::new()),
                None => (Vec::new(), vec![Arc::clone(&leaf)]),
            };
            node = Some(TrieNode {
                key: NodeKey::from(segment),
                children,
                leaves,
            });
        }
        let (children, leaves) = match node {
            Some(child) => (vec![Arc::new(child)], Vec::new()),
            None => (Vec::new(), vec![leaf]),
        };
        TrieNode {
            key: NodeKey::Root,
            children,
            leaves,
        }
    }

    /// Merge `other` into a copy of `self`. Both nodes must carry equal keys.
    ///
    /// Children with equal keys merge recursively, the rest are appended in
    /// order. Leaf lists are concatenated, `self` first.
    pub(crate) fn merge(&self, other: &TrieNode<T>) -> TrieNode<T> {
        debug_assert_eq!(self.key, other.key);
        let mut children = Vec::with_capacity(self.children.len() + other.children.len());
        let mut taken = vec![false; other.children.len()];

        for child in &self.children {
            let twin = other
                .children
                .iter()
                .enumerate()
                .find(|(i, c)| !taken[*i] && c.key == child.key);
            match twin {
                Some((i, twin)) => {
                    taken[i] = true;
                    children.push(Arc::new(child.merge(twin)));
                }
                None => children.push(Arc::clone(child)),
            }
        }
        for (i, child) in other.children.iter().enumerate() {
            if !taken[i] {
                children.push(Arc::clone(child));
            }
        }

        let mut leaves = self.leaves.clone();
        leaves.extend(other.leaves.iter().cloned());

        TrieNode {
            key: self.key.clone(),
            children,
            leaves,
        }
    }

    /// Depth-first search for the first leaf matching `path[offset..]`.
    ///
    /// Children are tried in insertion order, whatever their kind, so the
    /// route registered first wins; on failure the search backtracks. A
    /// parameter captures up to the next `/` and may capture nothing.
    pub(crate) fn find<'a>(
        &'a self,
        path: &[u8],
        offset: usize,
        req: &RequestView<'_>,
        params: &mut Vec<(String, String)>,
    ) -> Option<&'a Arc<Leaf<T>>> {
        if offset == path.len() {
            return self.leaves.iter().find(|leaf| leaf.filter.matches(req));
        }

        for child in &self.children {
            let found = match &child.key {
                NodeKey::Char(byte) if *byte == path[offset] => {
                    child.find(path, offset + 1, req, params)
                }
                NodeKey::Param(name) => {
                    let end = path[offset..]
                        .iter()
                        .position(|&b| b == b'/')
                        .map_or(path.len(), |p| offset + p);
                    params.push((
                        name.clone(),
                        String::from_utf8_lossy(&path[offset..end]).into_owned(),
                    ));
                    let found = child.find(path, end, req, params);
                    if found.is_none() {
                        params.pop();
                    }
                    found
                }
                _ => None,
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::expr::parse;
    use axum::http::Method;

    fn build(exprs: &[(&str, u32)]) -> TrieNode<u32> {
        let mut root: Option<TrieNode<u32>> = None;
        for (expr, target) in exprs {
            let pattern = parse(expr).unwrap();
            let leaf = Arc::new(Leaf::new(Arc::from(*expr), &pattern, *target));
            let branch = TrieNode::branch(&pattern, leaf);
            root = Some(match root {
                Some(existing) => existing.merge(&branch),
                None => branch,
            });
        }
        root.unwrap()
    }

    fn find(root: &TrieNode<u32>, method: Method, path: &str) -> Option<(u32, Vec<(String, String)>)> {
        let mut params = Vec::new();
        let req = RequestView {
            method: &method,
            host: None,
        };
        root.find(path.as_bytes(), 0, &req, &mut params)
            .map(|leaf| (leaf.target, params))
    }

    #[test]
    fn disjoint_prefixes_get_own_branches() {
        let root = build(&[(r#"Path("/a")"#, 1), (r#"Path("/b")"#, 2)]);
        assert_eq!(root.children.len(), 1); // shared '/'
        assert_eq!(root.children[0].children.len(), 2);
        assert_eq!(find(&root, Method::GET, "/a").unwrap().0, 1);
        assert_eq!(find(&root, Method::GET, "/b").unwrap().0, 2);
        assert!(find(&root, Method::GET, "/c").is_none());
        assert!(find(&root, Method::GET, "/ab").is_none());
    }

    #[test]
    fn shared_parameter_node_is_merged() {
        let root = build(&[(r#"Path("/a/<n>/b")"#, 1), (r#"Path("/a/<n>/c")"#, 2)]);
        // walk '/', 'a', '/'
        let slash = &root.children[0].children[0].children[0];
        assert_eq!(slash.children.len(), 1);
        let param = &slash.children[0];
        assert_eq!(param.key, NodeKey::Param("n".into()));
        assert_eq!(param.children.len(), 1); // shared '/'
        assert_eq!(param.children[0].children.len(), 2);

        let (target, params) = find(&root, Method::GET, "/a/42/c").unwrap();
        assert_eq!(target, 2);
        assert_eq!(params, vec![("n".to_string(), "42".to_string())]);
    }

    #[test]
    fn first_registered_wins_over_literal() {
        let root = build(&[(r#"Path("/a/<id>")"#, 1), (r#"Path("/a/b")"#, 2)]);
        assert_eq!(find(&root, Method::GET, "/a/b").unwrap().0, 1);

        let root = build(&[(r#"Path("/a/b")"#, 2), (r#"Path("/a/<id>")"#, 1)]);
        assert_eq!(find(&root, Method::GET, "/a/b").unwrap().0, 2);
        assert_eq!(find(&root, Method::GET, "/a/c").unwrap().0, 1);
    }

    #[test]
    fn backtracks_into_parameter() {
        let root = build(&[(r#"Path("/u/<id>/x")"#, 1), (r#"Path("/u/me")"#, 2)]);
        let (target, params) = find(&root, Method::GET, "/u/me/x").unwrap();
        assert_eq!(target, 1);
        assert_eq!(params, vec![("id".to_string(), "me".to_string())]);
    }

    #[test]
    fn method_filter_selects_leaf() {
        let root = build(&[
            (r#"Method("POST") && Path("/x")"#, 1),
            (r#"Method("GET") && Path("/x")"#, 2),
        ]);
        assert_eq!(find(&root, Method::POST, "/x").unwrap().0, 1);
        assert_eq!(find(&root, Method::GET, "/x").unwrap().0, 2);
        assert!(find(&root, Method::PUT, "/x").is_none());
    }

    #[test]
    fn same_path_keeps_insertion_order() {
        let root = build(&[(r#"Path("/x")"#, 1), (r#"Method("GET") && Path("/x")"#, 2)]);
        assert_eq!(find(&root, Method::GET, "/x").unwrap().0, 1);
    }

    #[test]
    fn parameter_may_capture_empty_segment() {
        let root = build(&[(r#"Path("/a/<id>/b")"#, 1)]);
        let (target, params) = find(&root, Method::GET, "/a//b").unwrap();
        assert_eq!(target, 1);
        assert_eq!(params, vec![("id".to_string(), String::new())]);
    }

    #[test]
    fn parameter_never_matches_past_the_end() {
        let root = build(&[(r#"Path("/a/<id>")"#, 1)]);
        assert!(find(&root, Method::GET, "/a/").is_none());
    }
}
