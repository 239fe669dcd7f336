//! Rate-limit bucket algorithms.
//!
//! Every algorithm is expressed over the `CounterStore` primitives
//! (`INCR` + `EXPIRE`), so the in-process and replicated backends behave
//! identically. A bucket check consumes first and refunds on denial; the
//! returned decision carries the undo handle so a caller evaluating a
//! chain can refund earlier buckets when a later one denies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::store::CounterStore;

/// A bucket algorithm with its parameters.
#[derive(Debug, Clone, Copy)]
pub enum Algorithm {
    /// Count requests in `[t0, t0+window)`, reset at the boundary.
    FixedWindow { window: Duration, limit: i64 },

    /// Weighted count over the current and previous window.
    SlidingWindow { window: Duration, limit: i64 },

    /// Capacity refilled at a fixed rate. Expressed as a counter that
    /// expires after one full-refill period.
    TokenBucket { capacity: i64, refill_per_sec: f64 },

    /// In-flight request counter. Paired with a `ConcurrencyGuard`.
    Concurrent { cap: i64 },
}

/// Outcome of a single bucket check.
#[derive(Debug)]
pub struct BucketDecision {
    pub allowed: bool,
    pub limit: i64,
    /// Remaining budget after this request.
    pub remaining: i64,
    /// How long a denied caller should wait.
    pub retry_after: Option<Duration>,
    /// Undo handle for the consumption, present only when allowed.
    pub(crate) consumed: Option<Consumed>,
}

/// A consumption that can be refunded.
#[derive(Debug, Clone)]
pub(crate) struct Consumed {
    pub key: String,
    pub amount: i64,
}

impl Consumed {
    pub(crate) fn refund(&self, store: &dyn CounterStore) {
        store.incr(&self.key, -self.amount);
    }
}

/// Safety net for crashed holders of a concurrent slot: the counter key
/// regains a TTL on every increment, so a node crash cannot pin slots
/// forever.
const CONCURRENT_SAFETY_TTL: Duration = Duration::from_secs(600);

/// Evaluate one bucket. `amount` is 1 for request-counting algorithms
/// and the computed unit count for cost buckets.
pub fn check(
    store: &dyn CounterStore,
    key: &str,
    algorithm: Algorithm,
    amount: i64,
    now_ms: u64,
) -> BucketDecision {
    match algorithm {
        Algorithm::FixedWindow { window, limit } => {
            let window_ms = window.as_millis().max(1) as u64;
            let slot = now_ms / window_ms;
            let slot_key = format!("{key}:{slot}");

            let value = store.incr(&slot_key, amount);
            if value == amount {
                store.expire(&slot_key, window);
            }

            if value > limit {
                store.incr(&slot_key, -amount);
                let retry = store
                    .ttl(&slot_key)
                    .unwrap_or_else(|| Duration::from_millis(window_ms - now_ms % window_ms));
                return denied(limit, retry);
            }
            allowed(limit, limit - value, slot_key, amount)
        }

        Algorithm::SlidingWindow { window, limit } => {
            let window_ms = window.as_millis().max(1) as u64;
            let slot = now_ms / window_ms;
            let curr_key = format!("{key}:{slot}");
            let prev_key = format!("{key}:{}", slot.wrapping_sub(1));

            let curr = store.incr(&curr_key, amount);
            if curr == amount {
                // Keep the slot around long enough to serve as "previous"
                store.expire(&curr_key, window * 2);
            }
            let prev = store.get(&prev_key).unwrap_or(0);
            let elapsed_frac = (now_ms % window_ms) as f64 / window_ms as f64;
            let weighted = prev as f64 * (1.0 - elapsed_frac) + curr as f64;

            if weighted > limit as f64 {
                store.incr(&curr_key, -amount);
                let retry = Duration::from_millis(window_ms - now_ms % window_ms);
                return denied(limit, retry);
            }
            allowed(limit, limit - weighted.ceil() as i64, curr_key, amount)
        }

        Algorithm::TokenBucket {
            capacity,
            refill_per_sec,
        } => {
            // Counter approximation over INCR/EXPIRE: the bucket drains a
            // full capacity per refill period, refilling when the key
            // expires.
            let period = Duration::from_secs_f64(
                (capacity as f64 / refill_per_sec.max(f64::EPSILON)).max(0.001),
            );
            let value = store.incr(key, amount);
            if value == amount {
                store.expire(key, period);
            }

            if value > capacity {
                store.incr(key, -amount);
                let retry = store.ttl(key).unwrap_or(period);
                return denied(capacity, retry);
            }
            allowed(capacity, capacity - value, key.to_string(), amount)
        }

        Algorithm::Concurrent { cap } => {
            let value = store.incr(key, amount);
            store.expire(key, CONCURRENT_SAFETY_TTL);

            if value > cap {
                store.incr(key, -amount);
                return denied(cap, Duration::from_secs(1));
            }
            allowed(cap, cap - value, key.to_string(), amount)
        }
    }
}

fn allowed(limit: i64, remaining: i64, key: String, amount: i64) -> BucketDecision {
    BucketDecision {
        allowed: true,
        limit,
        remaining: remaining.max(0),
        retry_after: None,
        consumed: Some(Consumed { key, amount }),
    }
}

fn denied(limit: i64, retry_after: Duration) -> BucketDecision {
    BucketDecision {
        allowed: false,
        limit,
        remaining: 0,
        retry_after: Some(retry_after),
        consumed: None,
    }
}

/// RAII handle for one occupied concurrency slot.
///
/// Dropping the guard releases the slot exactly once, on every exit path
/// — success, error, panic unwind, or future cancellation.
pub struct ConcurrencyGuard {
    store: Arc<dyn CounterStore>,
    key: String,
    amount: i64,
    released: AtomicBool,
}

impl ConcurrencyGuard {
    pub(crate) fn new(store: Arc<dyn CounterStore>, key: String, amount: i64) -> Self {
        Self {
            store,
            key,
            amount,
            released: AtomicBool::new(false),
        }
    }

    /// Release explicitly. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            let value = self.store.incr(&self.key, -self.amount);
            if value < 0 {
                // A lost safety-TTL reset underflowed the slot counter;
                // clamp rather than let remaining capacity inflate.
                self.store.incr(&self.key, -value);
            }
        }
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn fixed_window_caps_and_resets() {
        let store = MemoryStore::new();
        let algo = Algorithm::FixedWindow {
            window: WINDOW,
            limit: 2,
        };

        let d1 = check(&store, "fw:k", algo, 1, 1_000);
        let d2 = check(&store, "fw:k", algo, 1, 2_000);
        let d3 = check(&store, "fw:k", algo, 1, 3_000);
        assert!(d1.allowed && d2.allowed);
        assert!(!d3.allowed);
        assert_eq!(d2.remaining, 0);
        assert!(d3.retry_after.is_some());

        // Next window starts fresh
        let d4 = check(&store, "fw:k", algo, 1, 61_000);
        assert!(d4.allowed);
    }

    #[test]
    fn denied_fixed_window_does_not_consume() {
        let store = MemoryStore::new();
        let algo = Algorithm::FixedWindow {
            window: WINDOW,
            limit: 1,
        };
        check(&store, "fw:k", algo, 1, 1_000);
        for _ in 0..5 {
            assert!(!check(&store, "fw:k", algo, 1, 2_000).allowed);
        }
        // Slot counter stayed at the limit — denials refunded themselves
        assert_eq!(store.get("fw:k:0"), Some(1));
    }

    #[test]
    fn sliding_window_weights_previous_slot() {
        let store = MemoryStore::new();
        let algo = Algorithm::SlidingWindow {
            window: WINDOW,
            limit: 10,
        };

        // Fill the previous slot
        for i in 0..10 {
            assert!(check(&store, "sw:k", algo, 1, 1_000 + i).allowed);
        }
        // Early in the next slot the previous window still weighs ~1.0
        let d = check(&store, "sw:k", algo, 1, 60_500);
        assert!(!d.allowed);
        // Late in the next slot it has mostly decayed
        let d = check(&store, "sw:k", algo, 1, 119_000);
        assert!(d.allowed);
    }

    #[test]
    fn token_bucket_drains_and_refills_on_expiry() {
        let store = MemoryStore::new();
        let algo = Algorithm::TokenBucket {
            capacity: 3,
            // One full refill per 30ms
            refill_per_sec: 100.0,
        };
        for _ in 0..3 {
            assert!(check(&store, "tb:k", algo, 1, 0).allowed);
        }
        assert!(!check(&store, "tb:k", algo, 1, 0).allowed);

        std::thread::sleep(Duration::from_millis(50));
        assert!(check(&store, "tb:k", algo, 1, 0).allowed);
    }

    #[test]
    fn cost_amounts_consume_multiple_units() {
        let store = MemoryStore::new();
        let algo = Algorithm::TokenBucket {
            capacity: 10,
            refill_per_sec: 1.0,
        };
        assert!(check(&store, "cost:k", algo, 7, 0).allowed);
        let denied = check(&store, "cost:k", algo, 7, 0);
        assert!(!denied.allowed);
        // The denied consumption was refunded in full
        assert_eq!(store.get("cost:k"), Some(7));
        assert!(check(&store, "cost:k", algo, 3, 0).allowed);
    }

    #[test]
    fn concurrent_guard_releases_exactly_once() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let algo = Algorithm::Concurrent { cap: 2 };

        let d1 = check(store.as_ref(), "cc:k", algo, 1, 0);
        let d2 = check(store.as_ref(), "cc:k", algo, 1, 0);
        assert!(d1.allowed && d2.allowed);
        assert!(!check(store.as_ref(), "cc:k", algo, 1, 0).allowed);

        let guard = ConcurrencyGuard::new(store.clone(), "cc:k".into(), 1);
        guard.release();
        guard.release(); // idempotent
        assert_eq!(store.get("cc:k"), Some(1));

        // Drop path releases too
        drop(ConcurrencyGuard::new(store.clone(), "cc:k".into(), 1));
        assert_eq!(store.get("cc:k"), Some(0));
    }

    #[test]
    fn refund_restores_counter() {
        let store = MemoryStore::new();
        let algo = Algorithm::FixedWindow {
            window: WINDOW,
            limit: 5,
        };
        let d = check(&store, "r:k", algo, 1, 0);
        d.consumed.unwrap().refund(&store);
        assert_eq!(store.get("r:k:0"), Some(0));
    }
}
