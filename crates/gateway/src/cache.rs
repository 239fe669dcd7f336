//! Fingerprinted response cache.
//!
//! Keys are deterministic SHA-256 fingerprints over (route, method,
//! normalized query, body, principal). Entries are immutable, expire on
//! TTL, and are evicted least-recently-used at capacity. Only idempotent
//! routes that opted in are cached, and streamed responses never are.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Deterministic cache key for a request.
pub fn fingerprint(route: &str, method: &str, query: &str, body: &str, principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(route.as_bytes());
    hasher.update([0]);
    hasher.update(method.as_bytes());
    hasher.update([0]);
    // Normalize query parameter order
    let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    params.sort_unstable();
    hasher.update(params.join("&").as_bytes());
    hasher.update([0]);
    hasher.update(body.as_bytes());
    hasher.update([0]);
    hasher.update(principal.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct Entry {
    body: serde_json::Value,
    inserted_at: Instant,
    /// Recency stamp for LRU ordering.
    last_access: u64,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

/// TTL + LRU response cache. A single mutex guards the map; entries are
/// inserted whole, so readers never observe a torn entry.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_size: usize,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(enabled: bool, ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            ttl,
            max_size: max_size.max(1),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch a live entry, bumping its recency.
    pub fn get(&self, fp: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clock += 1;
        let clock = inner.clock;

        match inner.entries.get_mut(fp) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.last_access = clock;
                Some(entry.body.clone())
            }
            Some(_) => {
                inner.entries.remove(fp);
                None
            }
            None => None,
        }
    }

    /// Store a response. Last writer wins for the same fingerprint.
    pub fn put(&self, fp: &str, body: serde_json::Value) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clock += 1;
        let clock = inner.clock;

        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(fp) {
            // Evict the least recently used entry
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            fp.to_string(),
            Entry {
                body,
                inserted_at: Instant::now(),
                last_access: clock,
            },
        );
    }

    /// Purge entries; with a pattern, only fingerprints containing it.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.entries.len();
        match pattern {
            Some(p) => inner.entries.retain(|k, _| !k.contains(p)),
            None => inner.entries.clear(),
        }
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max: usize) -> ResponseCache {
        ResponseCache::new(true, Duration::from_millis(ttl_ms), max)
    }

    #[test]
    fn fingerprint_is_deterministic_and_principal_scoped() {
        let a = fingerprint("inference", "POST", "", r#"{"prompt":"x"}"#, "key1");
        let b = fingerprint("inference", "POST", "", r#"{"prompt":"x"}"#, "key1");
        let c = fingerprint("inference", "POST", "", r#"{"prompt":"x"}"#, "key2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn query_order_does_not_change_the_fingerprint() {
        let a = fingerprint("models", "GET", "a=1&b=2", "", "k");
        let b = fingerprint("models", "GET", "b=2&a=1", "", "k");
        assert_eq!(a, b);
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = cache(30, 10);
        cache.put("fp", serde_json::json!({"text": "cached"}));
        assert_eq!(cache.get("fp").unwrap()["text"], "cached");

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = cache(60_000, 2);
        cache.put("a", serde_json::json!(1));
        cache.put("b", serde_json::json!(2));
        // Touch "a" so "b" becomes the LRU
        cache.get("a");
        cache.put("c", serde_json::json!(3));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_with_and_without_pattern() {
        let cache = cache(60_000, 10);
        cache.put("aaa111", serde_json::json!(1));
        cache.put("bbb222", serde_json::json!(2));

        assert_eq!(cache.clear(Some("aaa")), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ResponseCache::new(false, Duration::from_secs(60), 10);
        cache.put("fp", serde_json::json!(1));
        assert!(cache.get("fp").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn last_writer_wins() {
        let cache = cache(60_000, 10);
        cache.put("fp", serde_json::json!({"v": 1}));
        cache.put("fp", serde_json::json!({"v": 2}));
        assert_eq!(cache.get("fp").unwrap()["v"], 2);
    }
}
