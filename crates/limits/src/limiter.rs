//! The rate limiter — a fixed chain of buckets per request.
//!
//! Evaluation order: global → tier-hourly → tier-minute →
//! tier-concurrent → route → cost. The first denial short-circuits and
//! refunds every bucket consumed during this evaluation. After
//! admission, fixed/sliding windows are non-refundable (they ticked);
//! the concurrency slot and cost units are returned on every exit path
//! via the verdict's guard and refund handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::adaptive::AdaptiveLimits;
use crate::bucket::{self, Algorithm, ConcurrencyGuard, Consumed};
use crate::store::CounterStore;
use crate::tier::{Tier, TierTable};

/// Cost unit granularity: one unit per 50 requested output tokens.
const TOKENS_PER_COST_UNIT: u64 = 50;

/// Inputs for one rate decision.
#[derive(Debug, Clone)]
pub struct RateCheck {
    /// Stable subject id: api-key id, user id, or client ip.
    pub subject: String,
    pub tier: Tier,
    /// Route label, e.g. "inference".
    pub route: String,
    /// Requested output tokens, for the cost bucket.
    pub max_tokens: u64,
}

impl RateCheck {
    pub fn cost_units(&self) -> i64 {
        (self.max_tokens.div_ceil(TOKENS_PER_COST_UNIT)).max(1) as i64
    }
}

/// Header values emitted on every decision, allow or deny.
#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset_secs: u64,
    pub tier: Tier,
}

impl RateLimitHeaders {
    pub fn as_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_secs.to_string()),
            ("X-RateLimit-Tier", self.tier.to_string()),
        ]
    }
}

/// Outcome of the bucket chain.
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub headers: RateLimitHeaders,
    /// Which bucket denied, e.g. "tier-minute".
    pub denied_by: Option<String>,
    pub retry_after: Option<Duration>,
    /// Held concurrency slot; dropping it releases the slot.
    pub guard: Option<ConcurrencyGuard>,
    cost_consumed: Option<Consumed>,
    store: Arc<dyn CounterStore>,
}

impl RateLimitVerdict {
    /// Refund the refundable buckets after a failed or cancelled
    /// request. Window buckets stay consumed; the cost units come back
    /// and the concurrency slot is released.
    pub fn refund_on_failure(&mut self) {
        if let Some(consumed) = self.cost_consumed.take() {
            consumed.refund(self.store.as_ref());
        }
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
    }
}

/// The gateway's rate limiter.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    tiers: TierTable,
    global_window: Duration,
    global_max: i64,
    /// Optional per-route requests-per-minute caps.
    route_limits: BTreeMap<String, i64>,
    adaptive: Option<AdaptiveLimits>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        tiers: TierTable,
        global_window: Duration,
        global_max: i64,
    ) -> Self {
        Self {
            store,
            tiers,
            global_window,
            global_max,
            route_limits: BTreeMap::new(),
            adaptive: None,
        }
    }

    pub fn with_route_limit(mut self, route: impl Into<String>, per_minute: i64) -> Self {
        self.route_limits.insert(route.into(), per_minute);
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveLimits) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Feed a request outcome into the adaptive layer.
    pub fn observe_outcome(&self, subject: &str, error: bool, latency_ms: f64) {
        if let Some(adaptive) = &self.adaptive {
            adaptive.observe(subject, error, latency_ms);
        }
    }

    /// Evaluate the whole chain for one request.
    pub fn check(&self, rc: &RateCheck) -> RateLimitVerdict {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.check_at(rc, now_ms)
    }

    fn check_at(&self, rc: &RateCheck, now_ms: u64) -> RateLimitVerdict {
        let limits = self.tiers.get(rc.tier);

        // The adaptive layer scales the per-minute budget within hard
        // bounds; everything else uses the tier numbers as-is.
        let minute_limit = match &self.adaptive {
            Some(adaptive) => adaptive.scaled_limit(&rc.subject, limits.requests_per_minute),
            None => limits.requests_per_minute,
        };

        let subject = &rc.subject;
        let chain: [(&str, String, Algorithm, i64); 6] = [
            (
                "global",
                "rl:global".into(),
                Algorithm::FixedWindow {
                    window: self.global_window,
                    limit: self.global_max,
                },
                1,
            ),
            (
                "tier-hourly",
                format!("rl:h:{}:{subject}", rc.tier),
                Algorithm::FixedWindow {
                    window: Duration::from_secs(3_600),
                    limit: limits.requests_per_hour,
                },
                1,
            ),
            (
                "tier-minute",
                format!("rl:m:{}:{subject}", rc.tier),
                Algorithm::SlidingWindow {
                    window: Duration::from_secs(60),
                    limit: minute_limit,
                },
                1,
            ),
            (
                "tier-concurrent",
                format!("rl:c:{subject}"),
                Algorithm::Concurrent {
                    cap: limits.concurrent,
                },
                1,
            ),
            (
                "route",
                format!("rl:r:{}:{subject}", rc.route),
                Algorithm::FixedWindow {
                    window: Duration::from_secs(60),
                    limit: self
                        .route_limits
                        .get(&rc.route)
                        .copied()
                        .unwrap_or(i64::MAX),
                },
                1,
            ),
            (
                "cost",
                format!("rl:cost:{subject}"),
                // Daily token quota expressed as a draining cost bucket
                Algorithm::TokenBucket {
                    capacity: (limits.daily_tokens / TOKENS_PER_COST_UNIT as i64).max(1),
                    refill_per_sec: (limits.daily_tokens / TOKENS_PER_COST_UNIT as i64).max(1)
                        as f64
                        / 86_400.0,
                },
                rc.cost_units(),
            ),
        ];

        let mut consumed: Vec<Consumed> = Vec::with_capacity(chain.len());
        let mut minute_limits: Option<(i64, i64)> = None;

        for (name, key, algorithm, amount) in chain {
            // Skip the route bucket entirely when the route has no cap
            if name == "route" && !self.route_limits.contains_key(&rc.route) {
                continue;
            }

            let decision = bucket::check(self.store.as_ref(), &key, algorithm, amount, now_ms);

            if !decision.allowed {
                debug!(
                    subject = %rc.subject,
                    bucket = name,
                    "Rate limit denied; refunding consumed buckets"
                );
                for earlier in &consumed {
                    earlier.refund(self.store.as_ref());
                }
                let retry = decision.retry_after.unwrap_or(Duration::from_secs(1));
                return RateLimitVerdict {
                    allowed: false,
                    headers: RateLimitHeaders {
                        limit: decision.limit,
                        remaining: 0,
                        reset_secs: retry.as_secs().max(1),
                        tier: rc.tier,
                    },
                    denied_by: Some(name.to_string()),
                    retry_after: Some(retry),
                    guard: None,
                    cost_consumed: None,
                    store: self.store.clone(),
                };
            }

            if name == "tier-minute" {
                minute_limits = Some((decision.limit, decision.remaining));
            }
            if let Some(c) = decision.consumed {
                consumed.push(c);
            }
        }

        // Partition the consumptions into their post-admission roles:
        // the concurrency slot and cost units stay refundable.
        let mut guard = None;
        let mut cost_consumed = None;
        for c in consumed {
            if c.key.starts_with("rl:c:") {
                guard = Some(ConcurrencyGuard::new(self.store.clone(), c.key, c.amount));
            } else if c.key.starts_with("rl:cost:") {
                cost_consumed = Some(c);
            }
        }

        let (minute_limit, minute_remaining) =
            minute_limits.expect("tier-minute always evaluated");
        RateLimitVerdict {
            allowed: true,
            headers: RateLimitHeaders {
                limit: minute_limit,
                remaining: minute_remaining,
                reset_secs: 60,
                tier: rc.tier,
            },
            denied_by: None,
            retry_after: None,
            guard,
            cost_consumed,
            store: self.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            MemoryStore::shared(),
            TierTable::builtin(),
            Duration::from_secs(60),
            1_000_000,
        )
    }

    fn check_of(tier: Tier, subject: &str) -> RateCheck {
        RateCheck {
            subject: subject.into(),
            tier,
            route: "inference".into(),
            max_tokens: 100,
        }
    }

    #[test]
    fn free_tier_minute_budget_denies_with_retry_after() {
        let limiter = limiter();
        let rc = check_of(Tier::Free, "k1");

        let mut verdicts = Vec::new();
        for _ in 0..10 {
            let mut v = limiter.check(&rc);
            assert!(v.allowed);
            // Release the concurrency slot so it never interferes
            v.refund_on_failure();
            verdicts.push(v);
        }

        let denied = limiter.check(&rc);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_by.as_deref(), Some("tier-minute"));
        assert!(denied.retry_after.is_some());
        assert_eq!(denied.headers.remaining, 0);
        assert_eq!(denied.headers.tier, Tier::Free);
    }

    #[test]
    fn concurrency_cap_enforced_until_guard_release() {
        let limiter = limiter();
        let rc = check_of(Tier::Free, "k2");

        // Free tier allows 2 concurrent; hold both slots
        let v1 = limiter.check(&rc);
        let v2 = limiter.check(&rc);
        assert!(v1.allowed && v2.allowed);

        let denied = limiter.check(&rc);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_by.as_deref(), Some("tier-concurrent"));

        drop(v1.guard);
        let v3 = limiter.check(&rc);
        assert!(v3.allowed);
    }

    #[test]
    fn deny_refunds_earlier_buckets() {
        let store = MemoryStore::shared();
        let limiter = RateLimiter::new(
            store.clone(),
            TierTable::builtin(),
            Duration::from_secs(60),
            1_000_000,
        );
        let rc = check_of(Tier::Free, "k3");

        // Saturate concurrency so the fourth bucket denies
        let _v1 = limiter.check(&rc);
        let _v2 = limiter.check(&rc);
        let hourly_before = store.get("rl:h:free:k3");

        let denied = limiter.check(&rc);
        assert!(!denied.allowed);
        // The hourly window consumed during the denied evaluation was
        // refunded
        assert_eq!(store.get("rl:h:free:k3"), hourly_before);
    }

    #[test]
    fn route_limit_applies_when_configured() {
        let limiter = RateLimiter::new(
            MemoryStore::shared(),
            TierTable::builtin(),
            Duration::from_secs(60),
            1_000_000,
        )
        .with_route_limit("inference", 1);

        let rc = check_of(Tier::Pro, "k4");
        let mut first = limiter.check(&rc);
        assert!(first.allowed);
        first.refund_on_failure();

        let denied = limiter.check(&rc);
        assert!(!denied.allowed);
        assert_eq!(denied.denied_by.as_deref(), Some("route"));
    }

    #[test]
    fn failure_refund_returns_cost_units_but_not_windows() {
        let store = MemoryStore::shared();
        let limiter = RateLimiter::new(
            store.clone(),
            TierTable::builtin(),
            Duration::from_secs(60),
            1_000_000,
        );
        let rc = check_of(Tier::Basic, "k5");

        let mut verdict = limiter.check(&rc);
        assert!(verdict.allowed);
        let hourly_after_admit = store.get("rl:h:basic:k5");
        assert_eq!(store.get("rl:cost:k5"), Some(rc.cost_units()));

        verdict.refund_on_failure();
        assert_eq!(store.get("rl:cost:k5"), Some(0));
        assert_eq!(store.get("rl:c:k5"), Some(0));
        // The hourly window stays ticked
        assert_eq!(store.get("rl:h:basic:k5"), hourly_after_admit);
    }

    #[test]
    fn subjects_do_not_interfere() {
        let limiter = limiter();
        let mut a = limiter.check(&check_of(Tier::Free, "alpha"));
        let b = limiter.check(&check_of(Tier::Free, "beta"));
        assert!(a.allowed && b.allowed);
        assert_eq!(a.headers.remaining, b.headers.remaining);
        a.refund_on_failure();
    }

    #[test]
    fn global_cap_denies_everyone() {
        let limiter = RateLimiter::new(
            MemoryStore::shared(),
            TierTable::builtin(),
            Duration::from_secs(60),
            1,
        );
        let mut first = limiter.check(&check_of(Tier::Enterprise, "a"));
        assert!(first.allowed);
        first.refund_on_failure();

        let denied = limiter.check(&check_of(Tier::Enterprise, "b"));
        assert!(!denied.allowed);
        assert_eq!(denied.denied_by.as_deref(), Some("global"));
    }

    #[test]
    fn cost_units_round_up() {
        let rc = RateCheck {
            subject: "s".into(),
            tier: Tier::Basic,
            route: "inference".into(),
            max_tokens: 101,
        };
        assert_eq!(rc.cost_units(), 3);
        let zero = RateCheck {
            max_tokens: 0,
            ..rc
        };
        assert_eq!(zero.cost_units(), 1);
    }
}
