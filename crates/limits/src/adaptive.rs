//! Per-subject adaptive limit scaling.
//!
//! Subjects that keep hitting upstream errors get a slowly raised
//! personal budget (generous to callers retrying through provider
//! trouble); subjects running clean and fast drift back toward the tier
//! default. The personal factor stays inside hard bounds and moves at
//! most 10 % per observation window.

use dashmap::DashMap;

const EMA_ALPHA: f64 = 0.1;
const MIN_FACTOR: f64 = 0.1;
const MAX_FACTOR: f64 = 10.0;
const STEP: f64 = 0.10;
const RAISE_ERROR_RATE: f64 = 0.05;
const SETTLE_ERROR_RATE: f64 = 0.01;
const SETTLE_LATENCY_MS: f64 = 100.0;

#[derive(Debug, Clone)]
struct SubjectState {
    error_ema: f64,
    latency_ema: f64,
    factor: f64,
    observations: u32,
}

impl Default for SubjectState {
    fn default() -> Self {
        Self {
            error_ema: 0.0,
            latency_ema: 0.0,
            factor: 1.0,
            observations: 0,
        }
    }
}

/// Adaptive limit state for all subjects.
pub struct AdaptiveLimits {
    subjects: DashMap<String, SubjectState>,
    /// Observations per adjustment window.
    window: u32,
}

impl AdaptiveLimits {
    pub fn new() -> Self {
        Self::with_window(20)
    }

    pub fn with_window(window: u32) -> Self {
        Self {
            subjects: DashMap::new(),
            window: window.max(1),
        }
    }

    /// Record one request outcome for a subject.
    pub fn observe(&self, subject: &str, error: bool, latency_ms: f64) {
        let mut state = self.subjects.entry(subject.to_string()).or_default();

        let error_sample = if error { 1.0 } else { 0.0 };
        state.error_ema += EMA_ALPHA * (error_sample - state.error_ema);
        state.latency_ema += EMA_ALPHA * (latency_ms - state.latency_ema);
        state.observations += 1;

        if state.observations >= self.window {
            state.observations = 0;
            if state.error_ema > RAISE_ERROR_RATE {
                state.factor = (state.factor * (1.0 + STEP)).min(MAX_FACTOR);
            } else if state.error_ema < SETTLE_ERROR_RATE
                && state.latency_ema < SETTLE_LATENCY_MS
            {
                // Move 10% of the way back toward the tier default
                state.factor += (1.0 - state.factor) * STEP;
            }
            state.factor = state.factor.clamp(MIN_FACTOR, MAX_FACTOR);
        }
    }

    /// Personal limit for a subject: tier base scaled by the subject's
    /// factor, never outside [base/10, base*10].
    pub fn scaled_limit(&self, subject: &str, base: i64) -> i64 {
        let factor = self
            .subjects
            .get(subject)
            .map(|s| s.factor)
            .unwrap_or(1.0);
        let scaled = (base as f64 * factor).round() as i64;
        scaled.clamp((base / 10).max(1), base.saturating_mul(10))
    }
}

impl Default for AdaptiveLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_subject_uses_tier_base() {
        let adaptive = AdaptiveLimits::new();
        assert_eq!(adaptive.scaled_limit("nobody", 60), 60);
    }

    #[test]
    fn sustained_errors_raise_the_limit_slowly() {
        let adaptive = AdaptiveLimits::with_window(5);
        for _ in 0..5 {
            adaptive.observe("s", true, 500.0);
        }
        let after_one_window = adaptive.scaled_limit("s", 100);
        assert!(after_one_window > 100);
        // One window moves at most 10%
        assert!(after_one_window <= 110);
    }

    #[test]
    fn clean_fast_traffic_settles_toward_default() {
        let adaptive = AdaptiveLimits::with_window(5);
        // Inflate first
        for _ in 0..50 {
            adaptive.observe("s", true, 500.0);
        }
        let inflated = adaptive.scaled_limit("s", 100);
        assert!(inflated > 100);

        // Then run clean and fast long enough for the error EMA to decay
        for _ in 0..200 {
            adaptive.observe("s", false, 20.0);
        }
        let settled = adaptive.scaled_limit("s", 100);
        assert!(settled < inflated);
    }

    #[test]
    fn factor_stays_inside_hard_bounds() {
        let adaptive = AdaptiveLimits::with_window(1);
        for _ in 0..1_000 {
            adaptive.observe("s", true, 500.0);
        }
        assert!(adaptive.scaled_limit("s", 100) <= 1_000);
    }
}
