//! Model/provider selection engine.
//!
//! `Router::select` is pure: given a normalized request, a strategy
//! name, and the routing context (circuit states, rate pressure, caller
//! hints), it returns an ordered fallback list of `(provider, model)`
//! candidates. It never dispatches and never retries — advancing through
//! the fallback list is the pipeline's job. Outcomes flow back through
//! `Router::on_result` to update observed performance and the adaptive
//! learner.

pub mod adaptive;
pub mod score;
pub mod strategy;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::provider::{Capability, ModelRecord, PerfWindow, ProviderRecord};
use llmrouter_core::registry::Registry;
use llmrouter_core::request::InferenceRequest;

use adaptive::{AdaptiveLearner, Observation, RequestFeatures};
use score::{ScoreBreakdown, ScoreInputs, ScoreModifiers};
use strategy::{
    Balanced, CostOptimized, FallbackChain, LoadBalanced, QualityFirst, ScoredCandidate,
    SpeedPriority, Strategy,
};

pub use adaptive::MIN_OBSERVATIONS;
pub use score::DEFAULT_WEIGHTS;

/// Per-request routing signals assembled by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// Providers whose circuit is open right now. Excluded entirely.
    pub circuit_open: BTreeSet<String>,

    /// Providers whose declared rate budget is exhausted this window.
    /// Down-weighted, not excluded.
    pub rate_exhausted: BTreeSet<String>,

    /// Caller signalled urgency; speed weighs more.
    pub urgency: bool,

    /// Caller signalled a strict budget; cost weighs more.
    pub budget_conscious: bool,

    /// Capabilities the request needs beyond what it implies itself.
    pub required_capabilities: BTreeSet<Capability>,

    /// Time available for the dispatch, for speed-priority filtering.
    pub deadline_ms: Option<u64>,

    pub min_quality: Option<f64>,
    pub max_cost_per_request: Option<f64>,
}

/// One entry of the fallback list.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: Arc<ProviderRecord>,
    pub model: ModelRecord,
}

impl Candidate {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider.id, self.model.id)
    }
}

/// The router's output for one request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub request_id: String,
    pub strategy: String,
    /// Ordered candidates; index 0 is the dispatch target, the rest are
    /// fallbacks.
    pub candidates: Vec<Candidate>,
    /// Score breakdown per candidate, aligned with `candidates`.
    pub scores: Vec<DecisionScore>,
    pub features: RequestFeatures,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionScore {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub breakdown: ScoreBreakdown,
}

impl Decision {
    pub fn chosen(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Providers in fallback order, for the error envelope.
    pub fn provider_chain(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.provider.id.clone()).collect()
    }
}

/// Outcome of one dispatch, fed back for adaptation.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub latency_ms: f64,
    pub cost: f64,
    pub tokens_per_sec: f64,
    /// Optional explicit quality feedback in [0, 1].
    pub quality_feedback: Option<f64>,
}

/// The selection engine.
pub struct Router {
    registry: Arc<Registry>,
    strategies: RwLock<HashMap<String, Arc<dyn Strategy>>>,
    default_strategy: String,
    weights: [f64; 5],
    /// Observed performance per "provider:model".
    perf: DashMap<String, PerfWindow>,
    /// In-flight dispatches per provider, for load balancing.
    inflight: DashMap<String, i64>,
    learner: AdaptiveLearner,
}

impl Router {
    pub fn new(registry: Arc<Registry>, default_strategy: &str, weights: [f64; 5]) -> Self {
        let router = Self {
            registry,
            strategies: RwLock::new(HashMap::new()),
            default_strategy: default_strategy.to_string(),
            weights,
            perf: DashMap::new(),
            inflight: DashMap::new(),
            learner: AdaptiveLearner::new(),
        };
        router.register_strategy(Arc::new(QualityFirst));
        router.register_strategy(Arc::new(CostOptimized));
        router.register_strategy(Arc::new(SpeedPriority));
        router.register_strategy(Arc::new(Balanced));
        router.register_strategy(Arc::new(LoadBalanced::new()));
        router.register_strategy(Arc::new(FallbackChain::new(Vec::new())));
        router
    }

    /// Install (or replace) a strategy under its own name.
    pub fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        let mut strategies = self.strategies.write().unwrap_or_else(|e| e.into_inner());
        strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Pure selection: no dispatch, no retry.
    pub fn select(
        &self,
        request: &InferenceRequest,
        strategy_name: Option<&str>,
        ctx: &RouteContext,
    ) -> Result<Decision> {
        let name = strategy_name.unwrap_or(&self.default_strategy);
        let strategy = {
            let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
            strategies
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::InvalidRequest {
                    message: format!("unknown routing strategy '{name}'"),
                    details: None,
                })?
        };

        let features = RequestFeatures::of(request);
        let snapshot = self.registry.snapshot();
        let mut scored: Vec<ScoredCandidate> = Vec::new();

        for (provider, model) in snapshot.candidates() {
            if !self.admissible(request, ctx, &provider, &model) {
                continue;
            }
            scored.push(self.score_candidate(request, ctx, &features, provider, model));
        }

        let ordered = strategy.order(scored, request, ctx);
        if ordered.is_empty() {
            return Err(GatewayError::NotFound(
                "no candidate matches the request".into(),
            ));
        }

        let request_id = request
            .metadata
            .get("requestId")
            .cloned()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let decision = Decision {
            request_id,
            strategy: name.to_string(),
            scores: ordered
                .iter()
                .map(|c| DecisionScore {
                    provider: c.provider.id.clone(),
                    model: c.model.id.clone(),
                    breakdown: c.breakdown.clone(),
                })
                .collect(),
            candidates: ordered
                .into_iter()
                .map(|c| Candidate {
                    provider: c.provider,
                    model: c.model,
                })
                .collect(),
            features,
            timestamp: Utc::now(),
        };

        debug!(
            strategy = name,
            chosen = %decision.chosen().map(|c| c.key()).unwrap_or_default(),
            fallbacks = decision.candidates.len() - 1,
            "Route selected"
        );
        Ok(decision)
    }

    /// After a context-length failure, pick one candidate with a larger
    /// window than the failed model. Used by the pipeline exactly once
    /// per request.
    pub fn larger_context_candidate(
        &self,
        decision: &Decision,
        failed_window: u32,
        required: u32,
    ) -> Option<Candidate> {
        decision
            .candidates
            .iter()
            .find(|c| c.model.context_window > failed_window && c.model.context_window >= required)
            .cloned()
    }

    /// Feed a dispatch outcome back into the perf windows and the
    /// adaptive learner.
    pub fn on_result(&self, decision: &Decision, outcome: &RouteOutcome) {
        let key = format!("{}:{}", outcome.provider, outcome.model);
        self.perf.entry(key.clone()).or_default().record(
            outcome.success,
            outcome.latency_ms,
            outcome.cost,
            outcome.tokens_per_sec,
        );
        self.learner.observe(
            &decision.features,
            &key,
            Observation {
                success: outcome.success,
                latency_ms: outcome.latency_ms,
                cost: outcome.cost,
                quality_feedback: outcome.quality_feedback,
            },
        );
    }

    /// The pipeline brackets each dispatch with these two calls so the
    /// load-balanced strategy sees live concurrency.
    pub fn begin_dispatch(&self, provider: &str) {
        *self.inflight.entry(provider.to_string()).or_insert(0) += 1;
    }

    pub fn end_dispatch(&self, provider: &str) {
        let mut entry = self.inflight.entry(provider.to_string()).or_insert(0);
        *entry = (*entry - 1).max(0);
    }

    fn admissible(
        &self,
        request: &InferenceRequest,
        ctx: &RouteContext,
        provider: &Arc<ProviderRecord>,
        model: &ModelRecord,
    ) -> bool {
        // Open circuit: excluded entirely, regardless of strategy
        if ctx.circuit_open.contains(&provider.id) {
            return false;
        }

        // Model pin
        if request.pin {
            let hint = request.model.as_deref().unwrap_or_default();
            let key = format!("{}:{}", provider.id, model.id);
            if hint != key && hint != model.id {
                return false;
            }
        }

        // Capability requirements, implied and explicit
        let caps = provider.model_capabilities(model);
        let mut required: BTreeSet<Capability> = ctx.required_capabilities.clone();
        if !request.tools.is_empty() {
            required.insert(Capability::FunctionCalling);
        }
        if request.stream {
            required.insert(Capability::Streaming);
        }
        if !required.iter().all(|c| caps.contains(c)) {
            return false;
        }

        // Context window must fit prompt plus requested completion
        model.context_window >= request.required_context()
    }

    fn score_candidate(
        &self,
        request: &InferenceRequest,
        ctx: &RouteContext,
        features: &RequestFeatures,
        provider: Arc<ProviderRecord>,
        model: ModelRecord,
    ) -> ScoredCandidate {
        let key = format!("{}:{}", provider.id, model.id);
        let estimated_cost = provider.estimate_cost(
            request.estimated_prompt_tokens(),
            request.max_tokens.unwrap_or(256),
        );

        let (p75, reliability) = match self.perf.get(&key) {
            Some(window) => (window.p75_latency_ms(), window.reliability()),
            None => (None, PerfWindow::default().reliability()),
        };

        // Learned stats override observation-derived numbers once the
        // feature key has enough history.
        let (p75, reliability, quality) = match self.learner.stats_for(features, &key) {
            Some(stats) => (
                Some(stats.latency_ema_ms).filter(|l| *l > 0.0).or(p75),
                stats.success_rate,
                (model.quality + stats.quality_from_feedback) / 2.0,
            ),
            None => (p75, reliability, model.quality),
        };

        let inflight = self.inflight.get(&provider.id).map(|v| *v).unwrap_or(0);
        let budget = provider.rate_budget_per_min.max(1) as f64;

        let breakdown = score::score(
            &ScoreInputs {
                quality,
                estimated_cost,
                p75_latency_ms: p75,
                circuit_open: false,
                rate_remaining_ratio: 1.0 - (inflight as f64 / budget).min(1.0),
                reliability,
                rate_exhausted: ctx.rate_exhausted.contains(&provider.id),
            },
            ScoreModifiers {
                urgency: ctx.urgency,
                budget_conscious: ctx.budget_conscious,
            },
            &self.weights,
        );

        ScoredCandidate {
            provider,
            model,
            breakdown,
            estimated_cost,
            expected_latency_ms: p75,
            load_ratio: inflight as f64 / budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrouter_core::provider::{AuthScheme, Dialect};

    fn record(id: &str, quality: f64, context_window: u32) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            base_url: String::new(),
            dialect: Dialect::OpenaiChat,
            auth: AuthScheme::Bearer,
            capabilities: BTreeSet::from([
                Capability::Chat,
                Capability::Streaming,
                Capability::FunctionCalling,
            ]),
            input_cost_per_m: 2.0,
            output_cost_per_m: 8.0,
            rate_budget_per_min: 600,
            models: vec![ModelRecord {
                id: format!("{id}-model"),
                context_window,
                capabilities: BTreeSet::new(),
                quality,
                loaded: true,
            }],
            region: None,
            compliance_tags: Vec::new(),
            version: 0,
        }
    }

    fn router_with(records: Vec<ProviderRecord>) -> Router {
        let registry = Arc::new(Registry::new());
        for r in records {
            registry.register(r).unwrap();
        }
        Router::new(registry, "balanced", DEFAULT_WEIGHTS)
    }

    fn request() -> InferenceRequest {
        InferenceRequest::from_prompt("hello")
    }

    #[test]
    fn selects_highest_quality_under_quality_first() {
        let router = router_with(vec![
            record("p_a", 0.9, 8_192),
            record("p_b", 0.8, 8_192),
        ]);
        let decision = router
            .select(&request(), Some("quality-first"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.chosen().unwrap().provider.id, "p_a");
        assert_eq!(decision.provider_chain(), vec!["p_a", "p_b"]);
    }

    #[test]
    fn open_circuit_excludes_candidate_entirely() {
        let router = router_with(vec![
            record("p_a", 0.9, 8_192),
            record("p_b", 0.8, 8_192),
        ]);
        let mut ctx = RouteContext::default();
        ctx.circuit_open.insert("p_a".into());

        let decision = router
            .select(&request(), Some("quality-first"), &ctx)
            .unwrap();
        assert_eq!(decision.provider_chain(), vec!["p_b"]);
    }

    #[test]
    fn exhausted_rate_budget_downweights_but_keeps() {
        let router = router_with(vec![
            record("p_a", 0.9, 8_192),
            record("p_b", 0.9, 8_192),
        ]);
        let mut ctx = RouteContext::default();
        ctx.rate_exhausted.insert("p_a".into());

        let decision = router.select(&request(), Some("balanced"), &ctx).unwrap();
        // Still present, but no longer first
        assert_eq!(decision.chosen().unwrap().provider.id, "p_b");
        assert!(decision.provider_chain().contains(&"p_a".to_string()));
    }

    #[test]
    fn context_window_hard_filter() {
        let router = router_with(vec![
            record("p_small", 0.99, 1_024),
            record("p_large", 0.5, 200_000),
        ]);
        let mut req = request();
        req.max_tokens = Some(4_000);

        let decision = router
            .select(&req, Some("quality-first"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.provider_chain(), vec!["p_large"]);
    }

    #[test]
    fn empty_candidate_set_is_an_error() {
        let router = router_with(vec![record("p_small", 0.9, 64)]);
        let mut req = request();
        req.max_tokens = Some(10_000);

        let err = router
            .select(&req, None, &RouteContext::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn unknown_strategy_is_invalid_request() {
        let router = router_with(vec![record("p_a", 0.9, 8_192)]);
        let err = router
            .select(&request(), Some("coin-flip"), &RouteContext::default())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn identical_state_yields_identical_fallback_list() {
        let router = router_with(vec![
            record("p_a", 0.7, 8_192),
            record("p_b", 0.7, 8_192),
            record("p_c", 0.7, 8_192),
        ]);
        let ctx = RouteContext::default();
        let first = router.select(&request(), Some("balanced"), &ctx).unwrap();
        for _ in 0..10 {
            let again = router.select(&request(), Some("balanced"), &ctx).unwrap();
            assert_eq!(first.provider_chain(), again.provider_chain());
        }
    }

    #[test]
    fn pinned_model_restricts_candidates() {
        let router = router_with(vec![
            record("p_a", 0.9, 8_192),
            record("p_b", 0.5, 8_192),
        ]);
        let mut req = request();
        req.model = Some("p_b:p_b-model".into());
        req.pin = true;

        let decision = router
            .select(&req, Some("quality-first"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.provider_chain(), vec!["p_b"]);
    }

    #[test]
    fn outcomes_update_perf_and_future_scoring() {
        let router = router_with(vec![
            record("p_a", 0.8, 8_192),
            record("p_b", 0.8, 8_192),
        ]);
        let ctx = RouteContext::default();
        let decision = router.select(&request(), Some("balanced"), &ctx).unwrap();

        // p_a keeps failing
        for _ in 0..50 {
            router.on_result(
                &decision,
                &RouteOutcome {
                    provider: "p_a".into(),
                    model: "p_a-model".into(),
                    success: false,
                    latency_ms: 0.0,
                    cost: 0.0,
                    tokens_per_sec: 0.0,
                    quality_feedback: None,
                },
            );
            router.on_result(
                &decision,
                &RouteOutcome {
                    provider: "p_b".into(),
                    model: "p_b-model".into(),
                    success: true,
                    latency_ms: 120.0,
                    cost: 0.001,
                    tokens_per_sec: 40.0,
                    quality_feedback: None,
                },
            );
        }

        let after = router.select(&request(), Some("balanced"), &ctx).unwrap();
        assert_eq!(after.chosen().unwrap().provider.id, "p_b");
    }

    #[test]
    fn larger_context_candidate_after_length_failure() {
        let router = router_with(vec![
            record("p_small", 0.9, 8_192),
            record("p_large", 0.8, 200_000),
        ]);
        let decision = router
            .select(&request(), Some("quality-first"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.chosen().unwrap().provider.id, "p_small");

        let bigger = router
            .larger_context_candidate(&decision, 8_192, 50_000)
            .unwrap();
        assert_eq!(bigger.provider.id, "p_large");
        assert!(router.larger_context_candidate(&decision, 200_000, 300_000).is_none());
    }

    #[test]
    fn tools_require_function_calling_capability() {
        let mut no_tools = record("p_plain", 0.9, 8_192);
        no_tools.capabilities = BTreeSet::from([Capability::Chat, Capability::Streaming]);
        let router = router_with(vec![no_tools, record("p_tools", 0.5, 8_192)]);

        let mut req = request();
        req.tools = vec![llmrouter_core::message::ToolDefinition {
            name: "t".into(),
            description: "d".into(),
            parameters: serde_json::json!({}),
        }];

        let decision = router
            .select(&req, Some("quality-first"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.provider_chain(), vec!["p_tools"]);
    }

    #[test]
    fn custom_strategy_registration() {
        struct FirstOnly;
        impl Strategy for FirstOnly {
            fn name(&self) -> &str {
                "first-only"
            }
            fn order(
                &self,
                mut candidates: Vec<ScoredCandidate>,
                _request: &InferenceRequest,
                _ctx: &RouteContext,
            ) -> Vec<ScoredCandidate> {
                candidates.truncate(1);
                candidates
            }
        }

        let router = router_with(vec![
            record("p_a", 0.9, 8_192),
            record("p_b", 0.8, 8_192),
        ]);
        router.register_strategy(Arc::new(FirstOnly));
        let decision = router
            .select(&request(), Some("first-only"), &RouteContext::default())
            .unwrap();
        assert_eq!(decision.candidates.len(), 1);
    }
}
