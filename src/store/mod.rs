//! Configuration store collaborator.
//!
//! # Data Flow
//! ```text
//! Writers (admin tooling, seeds, tests)
//!     → put / delete under the key prefix (revision += 1 per mutation)
//!
//! Readers:
//!     list(prefix)              → point-in-time listing + its revision
//!     watch(prefix, after_rev)  → ordered stream of later mutations
//! ```
//!
//! # Design Decisions
//! - The store is consumed, not implemented: consensus and delivery
//!   guarantees belong to it
//! - Revisions are strictly increasing; a watch never yields a revision
//!   at or below the one it was opened after
//! - A broken or lagging watch ends with `ProxyError::Feed`

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision of the last modification of this key.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOp {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub op: WatchOp,
    pub key: String,
    /// New value on `Put`, `None` on `Delete`.
    pub value: Option<String>,
    pub revision: u64,
}

/// Listing of a prefix, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub revision: u64,
    pub entries: Vec<KeyValue>,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Every key under `prefix` together with the store revision the
    /// listing reflects.
    async fn list(&self, prefix: &str) -> Result<Listing>;

    /// Mutations under `prefix` with a revision greater than
    /// `after_revision`, in revision order.
    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<WatchStream>;
}
