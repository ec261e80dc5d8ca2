//! In-process store with revisioned history and watches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::{ConfigStore, KeyValue, Listing, WatchEvent, WatchOp, WatchStream};
use crate::error::{ProxyError, Result};

const DEFAULT_HISTORY: usize = 10_000;
const BROADCAST_CAPACITY: usize = 4_096;

struct Inner {
    revision: u64,
    data: BTreeMap<String, KeyValue>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    breaker: CancellationToken,
}

/// `ConfigStore` kept in memory.
///
/// Holds the last `history_limit` mutations so watches can resume from an
/// older revision. `break_watches` severs every open watch, which is how
/// connectivity loss is simulated.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        f.debug_struct("MemoryStore")
            .field("revision", &inner.revision)
            .field("keys", &inner.data.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    pub fn with_history(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                data: BTreeMap::new(),
                history: VecDeque::new(),
                history_limit: history_limit.max(1),
                breaker: CancellationToken::new(),
            }),
            events,
        }
    }

    /// Set `key` to `value`. Returns the new revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> u64 {
        let key = key.into();
        let value = value.into();
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        inner.revision += 1;
        let revision = inner.revision;
        inner.data.insert(
            key.clone(),
            KeyValue {
                key: key.clone(),
                value: value.clone(),
                revision,
            },
        );
        self.record(
            &mut inner,
            WatchEvent {
                op: WatchOp::Put,
                key,
                value: Some(value),
                revision,
            },
        );
        revision
    }

    /// Serialize `value` as JSON and store it.
    pub fn put_json<T: serde::Serialize>(&self, key: impl Into<String>, value: &T) -> Result<u64> {
        let key = key.into();
        let encoded = serde_json::to_string(value).map_err(|source| ProxyError::Decode {
            key: key.clone(),
            source,
        })?;
        Ok(self.put(key, encoded))
    }

    /// Store every entry under `prefix`, keys taken relative to it.
    /// Returns the number of keys written.
    pub fn seed(&self, prefix: &str, entries: &BTreeMap<String, serde_json::Value>) -> Result<usize> {
        let prefix = prefix.trim_end_matches('/');
        for (key, value) in entries {
            self.put_json(format!("{}/{}", prefix, key.trim_start_matches('/')), value)?;
        }
        Ok(entries.len())
    }

    /// Remove `key`. Returns false if it did not exist.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        self.remove_locked(&mut inner, key)
    }

    /// Remove every key under `prefix`, deepest keys first. Returns the
    /// number of keys removed.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let keys: Vec<String> = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys.iter().rev() {
            self.remove_locked(&mut inner, key);
        }
        keys.len()
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().expect("memory store mutex poisoned").revision
    }

    /// End every open watch with a feed error.
    pub fn break_watches(&self) {
        let mut inner = self.inner.lock().expect("memory store mutex poisoned");
        let old = std::mem::replace(&mut inner.breaker, CancellationToken::new());
        old.cancel();
        tracing::debug!(revision = inner.revision, "Store watches broken");
    }

    fn remove_locked(&self, inner: &mut Inner, key: &str) -> bool {
        if inner.data.remove(key).is_none() {
            return false;
        }
        inner.revision += 1;
        let revision = inner.revision;
        self.record(
            inner,
            WatchEvent {
                op: WatchOp::Delete,
                key: key.to_string(),
                value: None,
                revision,
            },
        );
        true
    }

    fn record(&self, inner: &mut Inner, event: WatchEvent) {
        if inner.history.len() == inner.history_limit {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

struct WatchState {
    backlog: VecDeque<WatchEvent>,
    rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
    last: u64,
    broken: CancellationToken,
    done: bool,
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        Ok(inner.data.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let entries = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(Listing {
            revision: inner.revision,
            entries,
        })
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<WatchStream> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        if let Some(oldest) = inner.history.front() {
            if after_revision + 1 < oldest.revision {
                return Err(ProxyError::Feed(format!(
                    "revision {} has been compacted, oldest is {}",
                    after_revision, oldest.revision
                )));
            }
        }
        // Subscribing under the lock means no mutation falls between the
        // backlog and the live channel.
        let rx = self.events.subscribe();
        let backlog = inner
            .history
            .iter()
            .filter(|e| e.revision > after_revision && e.key.starts_with(prefix))
            .cloned()
            .collect();

        let state = WatchState {
            backlog,
            rx,
            prefix: prefix.to_string(),
            last: after_revision,
            broken: inner.breaker.clone(),
            done: false,
        };
        drop(inner);

        let stream = stream::unfold(state, |mut s| async move {
            if s.done {
                return None;
            }
            if let Some(event) = s.backlog.pop_front() {
                s.last = event.revision;
                return Some((Ok(event), s));
            }
            loop {
                tokio::select! {
                    biased;
                    _ = s.broken.cancelled() => {
                        s.done = true;
                        return Some((Err(ProxyError::Feed("watch connection lost".into())), s));
                    }
                    received = s.rx.recv() => match received {
                        Ok(event) => {
                            if event.revision <= s.last || !event.key.starts_with(&s.prefix) {
                                continue;
                            }
                            s.last = event.revision;
                            return Some((Ok(event), s));
                        }
                        Err(RecvError::Lagged(missed)) => {
                            s.done = true;
                            return Some((
                                Err(ProxyError::Feed(format!("watch lagged by {} events", missed))),
                                s,
                            ));
                        }
                        Err(RecvError::Closed) => {
                            s.done = true;
                            return Some((Err(ProxyError::Feed("store closed".into())), s));
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
