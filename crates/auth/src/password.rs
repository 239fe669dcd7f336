//! Password hashing and login lockout.
//!
//! bcrypt verification is CPU-bound (~100ms at cost 10), so it runs on
//! the blocking pool rather than stalling the request dispatch threads.

use std::time::Duration;

use dashmap::DashMap;
use llmrouter_core::error::{GatewayError, Result};

/// Hash a password with the configured cost. Production configs use
/// cost >= 10; tests use the bcrypt minimum to stay fast.
pub fn hash_password(plain: &str, rounds: u32) -> Result<String> {
    bcrypt::hash(plain, rounds)
        .map_err(|e| GatewayError::Internal(format!("bcrypt hash failed: {e}")))
}

/// Verify a password off the async threads.
pub async fn verify_password(plain: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(plain, &hash))
        .await
        .map_err(|e| GatewayError::Internal(format!("bcrypt worker failed: {e}")))?
        .map_err(|e| GatewayError::Internal(format!("bcrypt verify failed: {e}")))
}

/// Escalating lockout delays applied after the failure threshold.
const LOCKOUT_STEPS: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(240),
    Duration::from_secs(480),
];

/// Failures inside this window count toward the threshold.
const FAILURE_WINDOW_MS: u64 = 15 * 60 * 1_000;
const FAILURE_THRESHOLD: usize = 5;

#[derive(Debug, Default, Clone)]
struct LockoutState {
    /// Timestamps (ms) of recent failures.
    failures: Vec<u64>,
    /// How many lockouts have been applied in the current streak.
    escalation: usize,
    locked_until_ms: Option<u64>,
}

/// Per-username exponential login lockout.
pub struct LockoutTracker {
    states: DashMap<String, LockoutState>,
}

impl LockoutTracker {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Fails with `rate_limited` while the account is locked out.
    pub fn check(&self, username: &str, now_ms: u64) -> Result<()> {
        if let Some(state) = self.states.get(username) {
            if let Some(until) = state.locked_until_ms {
                if now_ms < until {
                    return Err(GatewayError::RateLimited {
                        reason: "too many failed login attempts".into(),
                        retry_after_ms: until - now_ms,
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a failed attempt; applies the next lockout step when the
    /// threshold is crossed inside the window.
    pub fn record_failure(&self, username: &str, now_ms: u64) {
        let mut state = self.states.entry(username.to_string()).or_default();
        state
            .failures
            .retain(|ts| ts + FAILURE_WINDOW_MS > now_ms);
        state.failures.push(now_ms);

        if state.failures.len() >= FAILURE_THRESHOLD {
            let step = LOCKOUT_STEPS[state.escalation.min(LOCKOUT_STEPS.len() - 1)];
            state.locked_until_ms = Some(now_ms + step.as_millis() as u64);
            state.escalation += 1;
            state.failures.clear();
            tracing::warn!(
                username,
                lockout_secs = step.as_secs(),
                "Login lockout applied"
            );
        }
    }

    /// A successful login clears the streak.
    pub fn record_success(&self, username: &str) {
        self.states.remove(username);
    }
}

impl Default for LockoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_COST: u32 = 4;

    #[tokio::test]
    async fn hash_and_verify_round_trip() {
        let hash = hash_password("hunter2", MIN_COST).unwrap();
        assert!(hash.starts_with("$2"));
        assert!(verify_password("hunter2".into(), hash.clone()).await.unwrap());
        assert!(!verify_password("wrong".into(), hash).await.unwrap());
    }

    #[test]
    fn five_failures_lock_with_escalating_steps() {
        let tracker = LockoutTracker::new();
        let t0 = 1_000_000u64;

        for i in 0..5 {
            assert!(tracker.check("alice", t0 + i).is_ok());
            tracker.record_failure("alice", t0 + i);
        }
        // First lockout: 30s
        let err = tracker.check("alice", t0 + 10).unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert!(tracker.check("alice", t0 + 31_000).is_ok());

        // A second streak escalates to 60s
        for i in 0..5 {
            tracker.record_failure("alice", t0 + 40_000 + i);
        }
        assert!(tracker.check("alice", t0 + 40_000 + 31_000).is_err());
        assert!(tracker.check("alice", t0 + 40_000 + 61_000).is_ok());
    }

    #[test]
    fn stale_failures_age_out_of_the_window() {
        let tracker = LockoutTracker::new();
        let t0 = 0u64;
        for i in 0..4 {
            tracker.record_failure("bob", t0 + i);
        }
        // The fifth failure lands after the window; no lockout
        tracker.record_failure("bob", t0 + FAILURE_WINDOW_MS + 1);
        assert!(tracker.check("bob", t0 + FAILURE_WINDOW_MS + 2).is_ok());
    }

    #[test]
    fn success_clears_the_streak() {
        let tracker = LockoutTracker::new();
        for i in 0..4 {
            tracker.record_failure("carol", i);
        }
        tracker.record_success("carol");
        tracker.record_failure("carol", 100);
        assert!(tracker.check("carol", 101).is_ok());
    }
}
