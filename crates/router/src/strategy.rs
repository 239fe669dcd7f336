//! Routing strategies.
//!
//! A strategy takes the scored, pre-filtered candidate set and returns
//! the ordered fallback list. Hard filters (capabilities, context
//! window, open circuits) run before any strategy sees the candidates;
//! strategies only reorder and apply their own policy filters.
//!
//! Ties always break on provider id, then model id, so a given state
//! yields one reproducible ordering.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use llmrouter_core::provider::{ModelRecord, ProviderRecord};
use llmrouter_core::request::InferenceRequest;

use crate::RouteContext;
use crate::score::ScoreBreakdown;

/// A candidate with its factor scores and dispatch estimates.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub provider: Arc<ProviderRecord>,
    pub model: ModelRecord,
    pub breakdown: ScoreBreakdown,
    pub estimated_cost: f64,
    pub expected_latency_ms: Option<f64>,
    /// In-flight dispatches over the provider's budget, for balancing.
    pub load_ratio: f64,
}

impl ScoredCandidate {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider.id, self.model.id)
    }
}

/// Deterministic tie-break: provider id, then model id.
fn by_ids(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    a.provider
        .id
        .cmp(&b.provider.id)
        .then_with(|| a.model.id.cmp(&b.model.id))
}

/// A routing strategy.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Filter and order the candidates; index 0 is the dispatch target.
    fn order(
        &self,
        candidates: Vec<ScoredCandidate>,
        request: &InferenceRequest,
        ctx: &RouteContext,
    ) -> Vec<ScoredCandidate>;
}

/// Highest declared quality wins.
pub struct QualityFirst;

impl Strategy for QualityFirst {
    fn name(&self) -> &str {
        "quality-first"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        if let Some(min) = ctx.min_quality {
            candidates.retain(|c| c.model.quality >= min);
        }
        candidates.sort_by(|a, b| {
            b.model
                .quality
                .total_cmp(&a.model.quality)
                .then_with(|| by_ids(a, b))
        });
        candidates
    }
}

/// Cheapest estimated request cost wins.
pub struct CostOptimized;

impl Strategy for CostOptimized {
    fn name(&self) -> &str {
        "cost-optimized"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        if let Some(cap) = ctx.max_cost_per_request {
            candidates.retain(|c| c.estimated_cost <= cap);
        }
        candidates.sort_by(|a, b| {
            a.estimated_cost
                .total_cmp(&b.estimated_cost)
                .then_with(|| by_ids(a, b))
        });
        candidates
    }
}

/// Lowest observed p75 latency wins; candidates that cannot meet the
/// deadline are dropped.
pub struct SpeedPriority;

impl Strategy for SpeedPriority {
    fn name(&self) -> &str {
        "speed-priority"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        if let Some(deadline) = ctx.deadline_ms {
            candidates.retain(|c| {
                c.expected_latency_ms
                    .is_none_or(|lat| lat <= deadline as f64)
            });
        }
        candidates.sort_by(|a, b| {
            let la = a.expected_latency_ms.unwrap_or(f64::MAX);
            let lb = b.expected_latency_ms.unwrap_or(f64::MAX);
            la.total_cmp(&lb).then_with(|| by_ids(a, b))
        });
        candidates
    }
}

/// Weighted multi-factor score, highest total first.
pub struct Balanced;

impl Strategy for Balanced {
    fn name(&self) -> &str {
        "balanced"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        _ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        candidates.sort_by(|a, b| {
            b.breakdown
                .total
                .total_cmp(&a.breakdown.total)
                .then_with(|| by_ids(a, b))
        });
        candidates
    }
}

/// Least-loaded provider first; equal load rotates round-robin.
pub struct LoadBalanced {
    rotation: AtomicUsize,
}

impl LoadBalanced {
    pub fn new() -> Self {
        Self {
            rotation: AtomicUsize::new(0),
        }
    }
}

impl Default for LoadBalanced {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LoadBalanced {
    fn name(&self) -> &str {
        "load-balanced"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        _ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        candidates.sort_by(|a, b| a.load_ratio.total_cmp(&b.load_ratio).then_with(|| by_ids(a, b)));
        if candidates.is_empty() {
            return candidates;
        }

        // Rotate within the least-loaded group so equal-load providers
        // take turns at the front.
        let min_ratio = candidates[0].load_ratio;
        let tied = candidates
            .iter()
            .take_while(|c| (c.load_ratio - min_ratio).abs() < 1e-9)
            .count();
        if tied > 1 {
            let offset = self.rotation.fetch_add(1, AtomicOrdering::Relaxed) % tied;
            candidates[..tied].rotate_left(offset);
        }
        candidates
    }
}

/// Fixed provider priority from configuration; anything not listed is
/// excluded.
pub struct FallbackChain {
    priority: Vec<String>,
}

impl FallbackChain {
    pub fn new(priority: Vec<String>) -> Self {
        Self { priority }
    }

    fn rank(&self, provider_id: &str) -> Option<usize> {
        self.priority.iter().position(|p| p == provider_id)
    }
}

impl Strategy for FallbackChain {
    fn name(&self) -> &str {
        "fallback-chain"
    }

    fn order(
        &self,
        mut candidates: Vec<ScoredCandidate>,
        _request: &InferenceRequest,
        _ctx: &RouteContext,
    ) -> Vec<ScoredCandidate> {
        candidates.retain(|c| self.rank(&c.provider.id).is_some());
        candidates.sort_by(|a, b| {
            self.rank(&a.provider.id)
                .cmp(&self.rank(&b.provider.id))
                .then_with(|| by_ids(a, b))
        });
        candidates
    }
}
