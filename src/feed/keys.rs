//! Key layout under the configuration prefix.
//!
//! ```text
//! <prefix>/hosts/<name>/host
//! <prefix>/listeners/<id>
//! <prefix>/backends/<id>/backend
//! <prefix>/backends/<id>/servers/<id>
//! <prefix>/frontends/<id>/frontend
//! <prefix>/frontends/<id>/middlewares/<id>
//! ```
//!
//! Directory keys (`<prefix>/backends/<id>`) classify like their entity key,
//! so deleting a whole directory reads as deleting the entity.

/// What a key refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Server { backend: String, id: String },
    Backend { id: String },
    Middleware { frontend: String, id: String },
    Frontend { id: String },
    Host { name: String },
    Listener { id: String },
}

/// Builds and classifies keys for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    /// A trailing `/` on the prefix is ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix with trailing `/`, suitable for listing and watching.
    pub fn root(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn host(&self, name: &str) -> String {
        format!("{}/hosts/{}/host", self.prefix, name)
    }

    pub fn listener(&self, id: &str) -> String {
        format!("{}/listeners/{}", self.prefix, id)
    }

    pub fn backend(&self, id: &str) -> String {
        format!("{}/backends/{}/backend", self.prefix, id)
    }

    pub fn backend_dir(&self, id: &str) -> String {
        format!("{}/backends/{}/", self.prefix, id)
    }

    pub fn server(&self, backend: &str, id: &str) -> String {
        format!("{}/backends/{}/servers/{}", self.prefix, backend, id)
    }

    pub fn frontend(&self, id: &str) -> String {
        format!("{}/frontends/{}/frontend", self.prefix, id)
    }

    pub fn frontend_dir(&self, id: &str) -> String {
        format!("{}/frontends/{}/", self.prefix, id)
    }

    pub fn middleware(&self, frontend: &str, id: &str) -> String {
        format!("{}/frontends/{}/middlewares/{}", self.prefix, frontend, id)
    }

    /// Classify `key`, or `None` for keys outside the schema.
    ///
    /// Patterns are tried most frequent first: server, backend, middleware,
    /// frontend, host, listener.
    pub fn classify(&self, key: &str) -> Option<KeyKind> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            ["backends", backend, "servers", id] => Some(KeyKind::Server {
                backend: backend.to_string(),
                id: id.to_string(),
            }),
            ["backends", id] | ["backends", id, "backend"] => Some(KeyKind::Backend { id: id.to_string() }),
            ["frontends", frontend, "middlewares", id] => Some(KeyKind::Middleware {
                frontend: frontend.to_string(),
                id: id.to_string(),
            }),
            ["frontends", id] | ["frontends", id, "frontend"] => {
                Some(KeyKind::Frontend { id: id.to_string() })
            }
            ["hosts", name] | ["hosts", name, "host"] => Some(KeyKind::Host { name: name.to_string() }),
            ["listeners", id] => Some(KeyKind::Listener { id: id.to_string() }),
            _ => None,
        }
    }
}
