//! Shared Ephemeral Cache
//!
//! TTL'd key/value store shared by every worker in the engine. Holds the
//! per-run allowance table, send-group dedup flags and per-(server, day)
//! usage counters. Entries with no TTL live until deleted or until the
//! engine shuts down.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use serde_json::Value;

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Clone, Default)]
pub struct EphemeralCache {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.inner.read().unwrap();
        entries.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        })
    }

    /// Store a value. `ttl: None` keeps it for the engine's lifetime.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.inner.write().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Atomically add `delta` to a numeric entry (missing or expired counts
    /// as 0, clamped at 0) and return the new value. The entry keeps its
    /// current TTL semantics: counters are written without one.
    pub fn increment(&self, key: &str, delta: i64) -> i64 {
        let mut entries = self.inner.write().unwrap();
        let current = entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.value.as_i64())
            .unwrap_or(0);
        let next = (current + delta).max(0);
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: Value::from(next),
                expires_at: None,
            },
        );
        next
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.inner.write().unwrap();
        entries.remove(key).is_some()
    }

    /// Drop every key starting with `prefix`, returning how many went away.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.inner.write().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Remove expired entries and return the count of remaining entries.
    pub fn prune_expired(&self) -> usize {
        let mut entries = self.inner.write().unwrap();
        entries.retain(|_, entry| !entry.is_expired());
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
