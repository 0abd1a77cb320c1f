//! In-process reference implementation of [`CoordStore`].
//!
//! Backs single-node deployments and every test in the workspace.
//! Multiple "instances" in a test share one `MemoryStore` (cheap to
//! clone, it's an `Arc` inside), which makes cross-instance behavior
//! fully deterministic.
//!
//! TTLs use the tokio clock, so `#[tokio::test(start_paused = true)]`
//! plus `tokio::time::advance` drives expiry deterministically.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{CoordStore, StoreError, Subscription};

enum Value {
    Str(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

/// A shared in-memory coordination store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the map and drops the entry under `key` if it expired.
    /// All accessors go through this so reads never observe dead keys.
    fn with_live_entry<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
        }
        f(inner.entries.get_mut(key))
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }
}

impl CoordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.insert(key, Value::Str(value.to_string()), ttl);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        let live = inner
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now));
        if live {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        match inner.entries.remove(key) {
            Some(e) => Ok(!e.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        let matches = match inner.entries.get(key) {
            Some(e) if e.is_expired(now) => false,
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => s == expected,
            _ => false,
        };
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(e) => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn expire_if_eq(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(e) => {
                let matches = matches!(&e.value, Value::Str(s) if s == expected);
                if matches {
                    e.expires_at = Some(Instant::now() + ttl);
                }
                Ok(matches)
            }
            None => Ok(false),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
        }
        match inner.entries.get_mut(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => {
                let n: i64 = s
                    .parse()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?;
                *s = (n + 1).to_string();
                Ok(n + 1)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str("1".to_string()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        // Check and insert under one guard; two concurrent first
        // pushes must both land.
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
        }
        match inner.entries.get_mut(key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                items.push(value.to_string());
                Ok(items.len())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn list_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => {
                let before = items.len();
                items.retain(|v| v != value);
                Ok(before - items.len())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        if inner.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            inner.entries.remove(key);
        }
        match inner.entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.insert(member.to_string())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(BTreeSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.remove(member)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(false),
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        })
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let now = Instant::now();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(subscribers) = inner.subscribers.get_mut(channel) else {
            return Ok(0);
        };
        // Drop subscribers whose receiver side is gone.
        subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
        Ok(subscribers.len())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
