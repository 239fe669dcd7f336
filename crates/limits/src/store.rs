//! Abstract counter store and the in-process backend.
//!
//! The trait is deliberately narrow — `incr`, `get`, `ttl`, `expire`,
//! `del` — so every algorithm in this crate can run unchanged against a
//! replicated Redis-style backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Key-value counter primitives shared by all rate-limit algorithms.
pub trait CounterStore: Send + Sync {
    /// Atomically add `by` (may be negative) and return the new value.
    /// Creates the key at 0 if absent.
    fn incr(&self, key: &str, by: i64) -> i64;

    /// Current value, if the key exists and has not expired.
    fn get(&self, key: &str) -> Option<i64>;

    /// Remaining time to live, if the key exists and has an expiry.
    fn ttl(&self, key: &str) -> Option<Duration>;

    /// Set the expiry of an existing key.
    fn expire(&self, key: &str, ttl: Duration);

    /// Remove a key.
    fn del(&self, key: &str);
}

struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process counter store. Per-node semantics; suitable for a single
/// instance or as the node-local tier of a replicated deployment.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn shared() -> Arc<dyn CounterStore> {
        Arc::new(Self::new())
    }

    /// Drop expired entries. Called opportunistically; correctness never
    /// depends on it because reads check expiry themselves.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.expired(now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    fn incr(&self, key: &str, by: i64) -> i64 {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if entry.expired(now) {
            entry.value = 0;
            entry.expires_at = None;
        }
        entry.value += by;
        entry.value
    }

    fn get(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        if entry.expired(Instant::now()) {
            return None;
        }
        Some(entry.value)
    }

    fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let at = entry.expires_at?;
        at.checked_duration_since(Instant::now())
    }

    fn expire(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn del(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_creates_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("a", 1), 1);
        assert_eq!(store.incr("a", 2), 3);
        assert_eq!(store.incr("a", -1), 2);
        assert_eq!(store.get("a"), Some(2));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn expiry_resets_counter() {
        let store = MemoryStore::new();
        store.incr("a", 5);
        store.expire("a", Duration::from_millis(10));
        assert!(store.ttl("a").is_some());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(store.get("a"), None);
        // A fresh incr starts from zero again
        assert_eq!(store.incr("a", 1), 1);
    }

    #[test]
    fn del_removes() {
        let store = MemoryStore::new();
        store.incr("a", 1);
        store.del("a");
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn sweep_evicts_expired_only() {
        let store = MemoryStore::new();
        store.incr("keep", 1);
        store.incr("drop", 1);
        store.expire("drop", Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));

        store.sweep();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("keep"), Some(1));
    }
}
