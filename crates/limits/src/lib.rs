//! Rate limiting and resource governance for the gateway.
//!
//! Every inbound request walks a fixed chain of buckets (global →
//! tier-hourly → tier-minute → tier-concurrent → route → cost). The first
//! denial short-circuits and everything consumed so far is refunded, so a
//! denied request never double-charges its subject.
//!
//! All algorithms operate on an abstract counter store expressible with
//! Redis `INCR`/`EXPIRE` primitives, so the in-process backend and a
//! replicated backend behave identically.

pub mod adaptive;
pub mod anomaly;
pub mod bucket;
pub mod limiter;
#[cfg(feature = "replicated")]
pub mod redis_store;
pub mod store;
pub mod tier;

pub use adaptive::AdaptiveLimits;
pub use anomaly::{AnomalyDetector, AnomalyFlag};
pub use bucket::{BucketDecision, ConcurrencyGuard};
pub use limiter::{RateCheck, RateLimitHeaders, RateLimiter, RateLimitVerdict};
pub use store::{CounterStore, MemoryStore};
pub use tier::{Tier, TierLimits, TierTable};
