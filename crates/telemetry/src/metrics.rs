//! Gateway metric aggregation.
//!
//! Lock-free counters for the hot path, bucketed histograms for latency
//! and cost, and per-provider success/failure tallies. A snapshot of
//! everything here backs the admin stats endpoint.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Latency histogram bucket upper bounds, milliseconds.
const LATENCY_BOUNDS_MS: [u64; 8] = [50, 100, 250, 500, 1_000, 2_500, 10_000, 30_000];

/// Cost histogram bucket upper bounds, micro-dollars.
const COST_BOUNDS_MICRO_USD: [u64; 6] = [100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

#[derive(Debug)]
struct Histogram<const N: usize> {
    buckets: [AtomicU64; N],
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl<const N: usize> Default for Histogram<N> {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl<const N: usize> Histogram<N> {
    fn observe(&self, value: u64, bounds: &[u64; N]) {
        match bounds.iter().position(|b| value <= *b) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, bounds: &[u64; N]) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: bounds
                .iter()
                .zip(self.buckets.iter())
                .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
                .collect(),
            overflow: self.overflow.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// `(upper_bound, count)` pairs.
    pub buckets: Vec<(u64, u64)>,
    pub overflow: u64,
    pub sum: u64,
    pub count: u64,
}

/// Per-provider dispatch tallies.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub success: u64,
    pub failure: u64,
    pub total_latency_ms: u64,
    pub total_cost: f64,
    pub circuit_opens: u64,
    pub circuit_closes: u64,
}

impl ProviderStats {
    pub fn mean_latency_ms(&self) -> f64 {
        if self.success == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.success as f64
    }
}

/// The gateway's metric registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_ms: Histogram<8>,
    cost_micro_usd: Histogram<6>,
    providers: RwLock<HashMap<String, ProviderStats>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observe_latency_ms(&self, latency_ms: u64) {
        self.latency_ms.observe(latency_ms, &LATENCY_BOUNDS_MS);
    }

    pub fn observe_cost(&self, cost_usd: f64) {
        let micro = (cost_usd * 1_000_000.0).max(0.0) as u64;
        self.cost_micro_usd.observe(micro, &COST_BOUNDS_MICRO_USD);
    }

    pub fn record_dispatch(&self, provider: &str, success: bool, latency_ms: u64, cost: f64) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let stats = providers.entry(provider.to_string()).or_default();
        if success {
            stats.success += 1;
            stats.total_latency_ms += latency_ms;
            stats.total_cost += cost;
        } else {
            stats.failure += 1;
        }
    }

    pub fn record_circuit_transition(&self, provider: &str, opened: bool) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let stats = providers.entry(provider.to_string()).or_default();
        if opened {
            stats.circuit_opens += 1;
        } else {
            stats.circuit_closes += 1;
        }
    }

    /// Point-in-time view for the admin surface.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let providers = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            latency_ms: self.latency_ms.snapshot(&LATENCY_BOUNDS_MS),
            cost_micro_usd: self.cost_micro_usd.snapshot(&COST_BOUNDS_MICRO_USD),
            providers,
        }
    }
}

/// Serialized metrics view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub latency_ms: HistogramSnapshot,
    pub cost_micro_usd: HistogramSnapshot,
    pub providers: HashMap<String, ProviderStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsRegistry::new();
        m.incr_requests();
        m.incr_requests();
        m.incr_errors();
        m.record_cache(true);
        m.record_cache(false);

        let snap = m.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
    }

    #[test]
    fn latency_lands_in_correct_bucket() {
        let m = MetricsRegistry::new();
        m.observe_latency_ms(75);
        m.observe_latency_ms(75);
        m.observe_latency_ms(99_999);

        let snap = m.snapshot().latency_ms;
        // 75ms falls in the <=100 bucket (index 1)
        assert_eq!(snap.buckets[1], (100, 2));
        assert_eq!(snap.overflow, 1);
        assert_eq!(snap.count, 3);
    }

    #[test]
    fn provider_stats_track_outcomes() {
        let m = MetricsRegistry::new();
        m.record_dispatch("p_oai", true, 120, 0.002);
        m.record_dispatch("p_oai", true, 80, 0.001);
        m.record_dispatch("p_oai", false, 0, 0.0);
        m.record_circuit_transition("p_oai", true);

        let snap = m.snapshot();
        let stats = &snap.providers["p_oai"];
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.circuit_opens, 1);
        assert!((stats.mean_latency_ms() - 100.0).abs() < f64::EPSILON);
    }
}
