//! Per-key cost ledger with hourly windows.
//!
//! Each API key accumulates tokens, requests, and spend inside the
//! current hour; the window rolls over on the boundary. The previous
//! window is kept so quota checks spanning a boundary stay meaningful.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// One hourly accounting window for a key.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerWindow {
    pub window_start: DateTime<Utc>,
    pub tokens: u64,
    pub requests: u64,
    pub cost: f64,
}

impl LedgerWindow {
    fn new(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            tokens: 0,
            requests: 0,
            cost: 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct KeyLedger {
    current: Option<LedgerWindow>,
    previous: Option<LedgerWindow>,
    lifetime_cost: f64,
    lifetime_requests: u64,
}

/// Thread-safe per-key cost ledger.
pub struct CostLedger {
    keys: RwLock<HashMap<String, KeyLedger>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Record one completed request against a key.
    pub fn record(&self, key: &str, tokens: u64, cost: f64) {
        self.record_at(key, tokens, cost, Utc::now());
    }

    fn record_at(&self, key: &str, tokens: u64, cost: f64, now: DateTime<Utc>) {
        let hour = now
            .duration_trunc(Duration::hours(1))
            .unwrap_or(now);

        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let ledger = keys.entry(key.to_string()).or_default();

        match &mut ledger.current {
            Some(window) if window.window_start == hour => {}
            current => {
                ledger.previous = current.take();
                *current = Some(LedgerWindow::new(hour));
            }
        }

        let window = ledger.current.as_mut().unwrap();
        window.tokens += tokens;
        window.requests += 1;
        window.cost += cost;
        ledger.lifetime_cost += cost;
        ledger.lifetime_requests += 1;
    }

    /// Current-hour window for a key, if any activity was recorded.
    pub fn current_window(&self, key: &str) -> Option<LedgerWindow> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(key).and_then(|l| l.current)
    }

    /// Lifetime spend for a key.
    pub fn lifetime_cost(&self, key: &str) -> f64 {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.get(key).map(|l| l.lifetime_cost).unwrap_or(0.0)
    }

    /// Total spend across all keys.
    pub fn total_cost(&self) -> f64 {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        keys.values().map(|l| l.lifetime_cost).sum()
    }
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accumulates_within_one_hour() {
        let ledger = CostLedger::new();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();

        ledger.record_at("k1", 100, 0.001, t);
        ledger.record_at("k1", 50, 0.0005, t + Duration::minutes(20));

        let window = ledger.current_window("k1").unwrap();
        assert_eq!(window.tokens, 150);
        assert_eq!(window.requests, 2);
        assert!((window.cost - 0.0015).abs() < 1e-12);
    }

    #[test]
    fn rolls_over_on_hour_boundary() {
        let ledger = CostLedger::new();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 10, 55, 0).unwrap();

        ledger.record_at("k1", 100, 0.01, t);
        ledger.record_at("k1", 200, 0.02, t + Duration::minutes(10));

        let window = ledger.current_window("k1").unwrap();
        assert_eq!(window.tokens, 200);
        assert_eq!(window.requests, 1);
        assert_eq!(
            window.window_start,
            Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap()
        );

        // Lifetime totals survive the rollover
        assert!((ledger.lifetime_cost("k1") - 0.03).abs() < 1e-12);
    }

    #[test]
    fn keys_are_independent() {
        let ledger = CostLedger::new();
        ledger.record("a", 10, 0.1);
        ledger.record("b", 20, 0.2);
        assert!((ledger.lifetime_cost("a") - 0.1).abs() < 1e-12);
        assert!((ledger.total_cost() - 0.3).abs() < 1e-12);
        assert!(ledger.current_window("missing").is_none());
    }
}
