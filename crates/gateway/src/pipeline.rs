//! The request pipeline.
//!
//! One fixed stage order, compiled at startup: validate → rate-check →
//! cache-lookup → route-select → dispatch (bounded fallback inside the
//! deadline) → transform → cache-store. Authentication happens in the
//! HTTP layer and hands an authenticated principal in; everything else
//! lives here.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use llmrouter_adapters::{Adapter, AdapterContext, AdapterResponse};
use llmrouter_auth::Principal;
use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::event::{EventBus, GatewayEvent};
use llmrouter_core::provider::Capability;
use llmrouter_core::registry::Registry;
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{
    EmbeddingResponse, FinishReason, InferenceResponse, StreamFrame, ToolCallOut,
};
use llmrouter_limits::{AnomalyDetector, RateCheck, RateLimiter, RateLimitVerdict, Tier, TierTable};
use llmrouter_router::{Candidate, Decision, RouteContext, RouteOutcome, Router};
use llmrouter_telemetry::{CostLedger, MetricsRegistry, PricingTable};

use crate::breaker::CircuitBreakers;
use crate::cache::{ResponseCache, fingerprint};
use crate::queue::DispatchQueue;
use crate::transform;

/// Client identity accompanying a request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub principal: Principal,
    pub ip: String,
    pub user_agent: String,
}

/// A successful pipeline outcome.
pub enum Reply {
    Json {
        body: serde_json::Value,
        cache_hit: bool,
        headers: Vec<(&'static str, String)>,
        request_id: String,
    },
    Stream {
        frames: mpsc::Receiver<Result<StreamFrame>>,
        headers: Vec<(&'static str, String)>,
        request_id: String,
    },
}

/// A failed pipeline outcome, with everything the envelope needs.
#[derive(Debug)]
pub struct Failure {
    pub error: GatewayError,
    pub request_id: String,
    pub attempts: Vec<String>,
    pub headers: Vec<(&'static str, String)>,
}

type PipelineResult<T> = std::result::Result<T, Box<Failure>>;

/// Pipeline tuning, derived from configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub provider_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub enable_fallback: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_retries: 2,
            enable_fallback: true,
        }
    }
}

pub struct Pipeline {
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub breakers: Arc<CircuitBreakers>,
    pub queue: Arc<DispatchQueue>,
    pub metrics: Arc<MetricsRegistry>,
    pub pricing: Arc<PricingTable>,
    pub ledger: Arc<CostLedger>,
    pub events: Arc<EventBus>,
    pub anomaly: Arc<AnomalyDetector>,
    pub tiers: TierTable,
    adapters: DashMap<String, Arc<dyn Adapter>>,
    /// Providers that returned an upstream 429, and when their budget
    /// window reopens. Feeds the router's down-weighting.
    rate_exhausted_until: DashMap<String, Instant>,
    options: PipelineOptions,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        breakers: Arc<CircuitBreakers>,
        queue: Arc<DispatchQueue>,
        metrics: Arc<MetricsRegistry>,
        pricing: Arc<PricingTable>,
        ledger: Arc<CostLedger>,
        events: Arc<EventBus>,
        tiers: TierTable,
        options: PipelineOptions,
    ) -> Self {
        Self {
            registry,
            router,
            limiter,
            cache,
            breakers,
            queue,
            metrics,
            pricing,
            ledger,
            events,
            anomaly: Arc::new(AnomalyDetector::new()),
            tiers,
            adapters: DashMap::new(),
            rate_exhausted_until: DashMap::new(),
            options,
        }
    }

    pub fn register_adapter(&self, provider_id: &str, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(provider_id.to_string(), adapter);
    }

    pub fn adapter(&self, provider_id: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(provider_id).map(|a| a.clone())
    }

    /// The full inference lifecycle for one request.
    pub async fn run_inference(
        &self,
        raw: serde_json::Value,
        meta: &RequestMeta,
    ) -> PipelineResult<Reply> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.metrics.incr_requests();

        // Transform + validate
        let raw = transform::standardize_inference_request(raw);
        let request: InferenceRequest = match serde_json::from_value(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                return Err(self.fail(
                    GatewayError::InvalidRequest {
                        message: format!("malformed request body: {e}"),
                        details: None,
                    },
                    request_id,
                    Vec::new(),
                    Vec::new(),
                ));
            }
        };
        if let Err(e) = request.validate() {
            return Err(self.fail(e, request_id, Vec::new(), Vec::new()));
        }

        // Anomaly log (advisory)
        self.observe_anomalies(meta);

        // Rate check
        let (mut verdict, headers) = self.rate_check(&request, meta, "inference");
        if !verdict.allowed {
            return Err(self.deny(
                verdict,
                meta.principal.rate_subject().to_string(),
                request_id,
                headers,
            ));
        }

        // Cache lookup: idempotent, non-streaming, opted in
        let fp = fingerprint(
            "inference",
            "POST",
            "",
            &raw.to_string(),
            meta.principal.rate_subject(),
        );
        if !request.stream {
            if let Some(hit) = self.cache.get(&fp) {
                self.metrics.record_cache(true);
                // Nothing reached an upstream; give back the refundable
                // buckets.
                verdict.refund_on_failure();
                let mut headers = headers;
                headers.push(("X-Cache", "HIT".into()));
                debug!(request_id = %request_id, "Cache hit");
                return Ok(Reply::Json {
                    body: hit,
                    cache_hit: true,
                    headers,
                    request_id,
                });
            }
            self.metrics.record_cache(false);
        }

        // Backpressure
        let deadline = Instant::now() + self.options.request_timeout;
        let permit = match self.queue.acquire(deadline).await {
            Ok(p) => p,
            Err(e) => {
                verdict.refund_on_failure();
                return Err(self.fail(e, request_id, Vec::new(), headers));
            }
        };

        // Route selection
        let ctx = self.route_context(&request);
        let strategy = request.metadata.get("strategy").map(|s| s.as_str());
        let decision = match self.router.select(&request, strategy, &ctx) {
            Ok(d) => d,
            Err(e) => {
                verdict.refund_on_failure();
                return Err(self.fail(
                    select_error(&ctx, e),
                    request_id,
                    Vec::new(),
                    headers,
                ));
            }
        };

        if request.stream {
            self.dispatch_stream(
                request, request_id, decision, verdict, permit, headers, deadline, meta,
            )
            .await
        } else {
            self.dispatch(
                request, fp, request_id, decision, verdict, permit, headers, deadline, meta,
            )
            .await
        }
    }

    /// Embeddings lifecycle: same governance, simpler dispatch.
    pub async fn run_embeddings(
        &self,
        model_hint: Option<String>,
        texts: Vec<String>,
        meta: &RequestMeta,
    ) -> PipelineResult<(EmbeddingResponse, Vec<(&'static str, String)>)> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.metrics.incr_requests();

        if texts.is_empty() {
            return Err(self.fail(
                GatewayError::InvalidRequest {
                    message: "'input' must contain at least one text".into(),
                    details: None,
                },
                request_id,
                Vec::new(),
                Vec::new(),
            ));
        }

        // A synthetic request so routing and rate cost see the payload
        let mut synthetic = InferenceRequest::from_prompt(texts.join("\n"));
        synthetic.model = model_hint;
        self.observe_anomalies(meta);

        let (mut verdict, headers) = self.rate_check(&synthetic, meta, "embeddings");
        if !verdict.allowed {
            return Err(self.deny(
                verdict,
                meta.principal.rate_subject().to_string(),
                request_id,
                headers,
            ));
        }

        let deadline = Instant::now() + self.options.request_timeout;
        let _permit = match self.queue.acquire(deadline).await {
            Ok(p) => p,
            Err(e) => {
                verdict.refund_on_failure();
                return Err(self.fail(e, request_id, Vec::new(), headers));
            }
        };

        let mut ctx = self.route_context(&synthetic);
        ctx.required_capabilities.insert(Capability::Embeddings);
        let decision = match self.router.select(&synthetic, None, &ctx) {
            Ok(d) => d,
            Err(e) => {
                verdict.refund_on_failure();
                return Err(self.fail(
                    select_error(&ctx, e),
                    request_id,
                    Vec::new(),
                    headers,
                ));
            }
        };

        let mut attempts = Vec::new();
        let mut last_err = GatewayError::NotFound("no embeddings candidate".into());

        for candidate in &decision.candidates {
            if attempts.len() > self.options.max_retries as usize {
                break;
            }
            let provider_id = candidate.provider.id.clone();
            let Some(adapter) = self.adapter(&provider_id) else {
                continue;
            };
            if self.breakers.try_acquire(&provider_id).is_err() {
                continue;
            }
            attempts.push(provider_id.clone());

            let ctx = AdapterContext::new(&request_id, &candidate.model.id)
                .with_deadline(deadline);
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.attempt_budget(deadline),
                adapter.embed(&texts, &ctx),
            )
            .await;

            match flatten_timeout(result, &provider_id) {
                Ok(response) => {
                    self.breakers.record_success(&provider_id);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.metrics.record_dispatch(&provider_id, true, latency_ms, 0.0);
                    self.ledger.record(
                        meta.principal.rate_subject(),
                        response.usage.total_tokens as u64,
                        0.0,
                    );
                    return Ok((response, headers));
                }
                Err(e) => {
                    if e.counts_against_circuit() {
                        self.breakers.record_failure(&provider_id);
                    }
                    self.metrics.record_dispatch(&provider_id, false, 0, 0.0);
                    let fallback = e.triggers_fallback();
                    last_err = e;
                    if !fallback || !self.options.enable_fallback {
                        break;
                    }
                }
            }
        }

        verdict.refund_on_failure();
        self.metrics.incr_errors();
        Err(self.fail(last_err, request_id, attempts, headers))
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        request: InferenceRequest,
        fp: String,
        request_id: String,
        decision: Decision,
        mut verdict: RateLimitVerdict,
        _permit: tokio::sync::OwnedSemaphorePermit,
        mut headers: Vec<(&'static str, String)>,
        deadline: Instant,
        meta: &RequestMeta,
    ) -> PipelineResult<Reply> {
        let mut candidates: VecDeque<Candidate> = decision.candidates.iter().cloned().collect();
        let max_attempts = if self.options.enable_fallback {
            self.options.max_retries as usize + 1
        } else {
            1
        };

        let mut attempts: Vec<String> = Vec::new();
        let mut last_err = GatewayError::NotFound("no candidate".into());
        let mut rerouted_for_context = false;

        while let Some(candidate) = candidates.pop_front() {
            if attempts.len() >= max_attempts {
                break;
            }
            if Instant::now() >= deadline {
                last_err = GatewayError::ProviderTimeout {
                    provider: candidate.provider.id.clone(),
                    elapsed_ms: self.options.request_timeout.as_millis() as u64,
                };
                break;
            }

            let provider_id = candidate.provider.id.clone();
            let Some(adapter) = self.adapter(&provider_id) else {
                warn!(provider = %provider_id, "No adapter registered; skipping candidate");
                continue;
            };
            if let Err(refused) = self.breakers.try_acquire(&provider_id) {
                // Local refusal: no network call, no circuit counting
                last_err = refused;
                continue;
            }

            attempts.push(provider_id.clone());
            self.router.begin_dispatch(&provider_id);
            let adapter_ctx = AdapterContext::new(&request_id, &candidate.model.id)
                .with_deadline(deadline);
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.attempt_budget(deadline),
                adapter.invoke(&request, &adapter_ctx),
            )
            .await;
            self.router.end_dispatch(&provider_id);
            let latency_ms = started.elapsed().as_millis() as u64;

            match flatten_timeout(result, &provider_id) {
                Ok(response) => {
                    let body = self.complete_success(
                        &request, &decision, &candidate, response, latency_ms, &request_id,
                        &attempts, meta,
                    );
                    if !request.stream {
                        self.cache.put(&fp, body.clone());
                    }
                    headers.push(("X-Cache", "MISS".into()));
                    return Ok(Reply::Json {
                        body,
                        cache_hit: false,
                        headers,
                        request_id,
                    });
                }
                Err(e) => {
                    self.record_dispatch_failure(&decision, &candidate, &e, latency_ms, meta);

                    // One reroute to a larger context window, then surface
                    if let GatewayError::ContextLengthExceeded { .. } = &e {
                        if !rerouted_for_context {
                            rerouted_for_context = true;
                            if let Some(bigger) = self.router.larger_context_candidate(
                                &decision,
                                candidate.model.context_window,
                                request.required_context(),
                            ) {
                                info!(
                                    from = %candidate.key(),
                                    to = %bigger.key(),
                                    "Rerouting once to a larger context window"
                                );
                                candidates.push_front(bigger);
                                last_err = e;
                                continue;
                            }
                        }
                    }

                    let fallback = e.triggers_fallback();
                    last_err = e;
                    if !fallback || !self.options.enable_fallback {
                        break;
                    }
                }
            }
        }

        verdict.refund_on_failure();
        self.metrics.incr_errors();
        Err(self.fail(last_err, request_id, attempts, headers))
    }

    /// Streaming dispatch: fallback applies only until the first frame;
    /// once the caller has seen tokens, a mid-stream failure terminates
    /// the stream with an error frame instead of switching providers.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_stream(
        &self,
        request: InferenceRequest,
        request_id: String,
        decision: Decision,
        mut verdict: RateLimitVerdict,
        permit: tokio::sync::OwnedSemaphorePermit,
        headers: Vec<(&'static str, String)>,
        deadline: Instant,
        meta: &RequestMeta,
    ) -> PipelineResult<Reply> {
        let max_attempts = if self.options.enable_fallback {
            self.options.max_retries as usize + 1
        } else {
            1
        };

        let mut attempts: Vec<String> = Vec::new();
        let mut last_err = GatewayError::NotFound("no candidate".into());

        for candidate in decision.candidates.iter().cloned() {
            if attempts.len() >= max_attempts || Instant::now() >= deadline {
                break;
            }
            let provider_id = candidate.provider.id.clone();
            let Some(adapter) = self.adapter(&provider_id) else {
                continue;
            };
            if let Err(refused) = self.breakers.try_acquire(&provider_id) {
                last_err = refused;
                continue;
            }

            attempts.push(provider_id.clone());
            self.router.begin_dispatch(&provider_id);
            let adapter_ctx = AdapterContext::new(&request_id, &candidate.model.id)
                .with_deadline(deadline);
            let result = tokio::time::timeout(
                self.attempt_budget(deadline),
                adapter.stream(&request, &adapter_ctx),
            )
            .await;

            match flatten_timeout(result, &provider_id) {
                Ok(upstream) => {
                    let frames = self.relay_stream(
                        upstream,
                        decision.clone(),
                        candidate.clone(),
                        request_id.clone(),
                        meta.principal.rate_subject().to_string(),
                        verdict,
                        permit,
                    );
                    return Ok(Reply::Stream {
                        frames,
                        headers,
                        request_id,
                    });
                }
                Err(e) => {
                    self.router.end_dispatch(&provider_id);
                    if e.counts_against_circuit() {
                        self.breakers.record_failure(&provider_id);
                    }
                    self.metrics.record_dispatch(&provider_id, false, 0, 0.0);
                    let fallback = e.triggers_fallback();
                    last_err = e;
                    if !fallback || !self.options.enable_fallback {
                        break;
                    }
                }
            }
        }

        verdict.refund_on_failure();
        self.metrics.incr_errors();
        Err(self.fail(last_err, request_id, attempts, headers))
    }

    /// Forward upstream frames, enforce the exactly-one-terminal-frame
    /// contract, and settle accounting when the stream ends. The rate
    /// verdict and concurrency permit ride inside the task so the slot
    /// is held for the stream's whole life, including cancellation.
    #[allow(clippy::too_many_arguments)]
    fn relay_stream(
        &self,
        mut upstream: mpsc::Receiver<Result<StreamFrame>>,
        decision: Decision,
        candidate: Candidate,
        request_id: String,
        subject: String,
        mut verdict: RateLimitVerdict,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> mpsc::Receiver<Result<StreamFrame>> {
        let (tx, rx) = mpsc::channel(64);
        let router = self.router.clone();
        let breakers = self.breakers.clone();
        let metrics = self.metrics.clone();
        let ledger = self.ledger.clone();
        let events = self.events.clone();
        let pricing = self.pricing.clone();
        let provider_id = candidate.provider.id.clone();
        let model_id = candidate.model.id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let mut completed = false;
            let mut usage_total: u64 = 0;
            let mut cost = 0.0;

            while let Some(item) = upstream.recv().await {
                match item {
                    Ok(frame) => {
                        let terminal = frame.is_terminal();
                        if terminal {
                            if let Some(usage) = &frame.usage {
                                usage_total = usage.total_tokens as u64;
                                let key = format!("{provider_id}:{model_id}");
                                cost = pricing.compute_cost(
                                    &key,
                                    usage.prompt_tokens,
                                    usage.completion_tokens,
                                );
                                if cost == 0.0 {
                                    cost = candidate
                                        .provider
                                        .estimate_cost(usage.prompt_tokens, usage.completion_tokens);
                                }
                            }
                            completed = true;
                        }
                        if tx.send(Ok(frame)).await.is_err() {
                            // Caller went away; abort upstream by drop
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(e) => {
                        // Tokens may already be on the wire: no provider
                        // switch, emit the error terminator instead.
                        warn!(provider = %provider_id, error = %e, "Mid-stream failure");
                        if e.counts_against_circuit() {
                            breakers.record_failure(&provider_id);
                        }
                        let _ = tx
                            .send(Ok(StreamFrame::terminal(FinishReason::Error, None)))
                            .await;
                        break;
                    }
                }
            }

            let latency_ms = started.elapsed().as_millis() as u64;
            router.end_dispatch(&provider_id);
            router.on_result(
                &decision,
                &RouteOutcome {
                    provider: provider_id.clone(),
                    model: model_id.clone(),
                    success: completed,
                    latency_ms: latency_ms as f64,
                    cost,
                    tokens_per_sec: if latency_ms > 0 {
                        usage_total as f64 / (latency_ms as f64 / 1_000.0)
                    } else {
                        0.0
                    },
                    quality_feedback: None,
                },
            );
            metrics.record_dispatch(&provider_id, completed, latency_ms, cost);
            metrics.observe_latency_ms(latency_ms);
            if completed {
                breakers.record_success(&provider_id);
                metrics.observe_cost(cost);
                ledger.record(&subject, usage_total, cost);
            } else {
                metrics.incr_errors();
                // The upstream never finished; give the cost units back
                verdict.refund_on_failure();
            }
            events.publish(GatewayEvent::RequestCompleted {
                request_id,
                provider: provider_id,
                model: model_id,
                success: completed,
                latency_ms,
                cost,
                timestamp: Utc::now(),
            });
        });

        rx
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn observe_anomalies(&self, meta: &RequestMeta) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let flags = self.anomaly.record(
            &meta.ip,
            &meta.user_agent,
            meta.principal.rate_subject(),
            now_ms,
        );
        for flag in flags {
            self.events.publish(GatewayEvent::AnomalyFlagged {
                subject: meta.principal.rate_subject().to_string(),
                rule: format!("{flag:?}")
                    .split_whitespace()
                    .next()
                    .unwrap_or("anomaly")
                    .trim_end_matches('{')
                    .to_string(),
                detail: format!("{flag:?}"),
                timestamp: Utc::now(),
            });
        }
    }

    fn rate_check(
        &self,
        request: &InferenceRequest,
        meta: &RequestMeta,
        route: &str,
    ) -> (RateLimitVerdict, Vec<(&'static str, String)>) {
        let tier = Tier::detect(
            meta.principal.is_admin(),
            meta.principal
                .key_id
                .as_deref()
                .and_then(|_| Tier::parse(&meta.principal.tier)),
            Tier::parse(&meta.principal.tier),
        );
        let rc = RateCheck {
            subject: meta.principal.rate_subject().to_string(),
            tier,
            route: route.to_string(),
            max_tokens: request.max_tokens.unwrap_or(256) as u64,
        };
        let verdict = self.limiter.check(&rc);
        let headers: Vec<(&'static str, String)> = verdict.headers.as_pairs();
        (verdict, headers)
    }

    fn route_context(&self, request: &InferenceRequest) -> RouteContext {
        let now = Instant::now();
        self.rate_exhausted_until.retain(|_, until| *until > now);
        let mut ctx = RouteContext {
            circuit_open: self.breakers.refusing_providers(),
            rate_exhausted: self
                .rate_exhausted_until
                .iter()
                .map(|e| e.key().clone())
                .collect(),
            deadline_ms: Some(self.options.request_timeout.as_millis() as u64),
            ..Default::default()
        };
        let meta = &request.metadata;
        ctx.urgency = meta.get("urgency").is_some_and(|v| v == "high");
        ctx.budget_conscious = meta
            .get("budget")
            .is_some_and(|v| v == "strict" || v == "low");
        ctx.min_quality = meta.get("minQuality").and_then(|v| v.parse().ok());
        ctx.max_cost_per_request = meta.get("maxCostPerRequest").and_then(|v| v.parse().ok());
        if meta.get("vision").is_some_and(|v| v == "true") {
            ctx.required_capabilities.insert(Capability::Vision);
        }
        ctx
    }

    fn attempt_budget(&self, deadline: Instant) -> Duration {
        self.options
            .provider_timeout
            .min(deadline.saturating_duration_since(Instant::now()))
    }

    #[allow(clippy::too_many_arguments)]
    fn complete_success(
        &self,
        request: &InferenceRequest,
        decision: &Decision,
        candidate: &Candidate,
        response: AdapterResponse,
        latency_ms: u64,
        request_id: &str,
        attempts: &[String],
        meta: &RequestMeta,
    ) -> serde_json::Value {
        let provider_id = &candidate.provider.id;
        self.breakers.record_success(provider_id);

        let usage = response.usage;
        let key = format!("{provider_id}:{}", candidate.model.id);
        let mut cost = self
            .pricing
            .compute_cost(&key, usage.prompt_tokens, usage.completion_tokens);
        if cost == 0.0 {
            cost = candidate
                .provider
                .estimate_cost(usage.prompt_tokens, usage.completion_tokens);
        }
        let tier = Tier::parse(&meta.principal.tier).unwrap_or(Tier::Free);
        let charged = cost * self.tiers.get(tier).cost_multiplier;

        self.router.on_result(
            decision,
            &RouteOutcome {
                provider: provider_id.clone(),
                model: candidate.model.id.clone(),
                success: true,
                latency_ms: latency_ms as f64,
                cost,
                tokens_per_sec: if latency_ms > 0 {
                    usage.completion_tokens as f64 / (latency_ms as f64 / 1_000.0)
                } else {
                    0.0
                },
                quality_feedback: None,
            },
        );
        self.limiter
            .observe_outcome(meta.principal.rate_subject(), false, latency_ms as f64);
        self.metrics.record_dispatch(provider_id, true, latency_ms, cost);
        self.metrics.observe_latency_ms(latency_ms);
        self.metrics.observe_cost(cost);
        self.ledger.record(
            meta.principal.rate_subject(),
            usage.total_tokens as u64,
            charged,
        );
        self.events.publish(GatewayEvent::RequestCompleted {
            request_id: request_id.to_string(),
            provider: provider_id.clone(),
            model: candidate.model.id.clone(),
            success: true,
            latency_ms,
            cost,
            timestamp: Utc::now(),
        });

        let mut metadata: BTreeMap<String, String> = request.metadata.clone();
        metadata.insert("requestId".into(), request_id.to_string());
        metadata.insert("processingTimeMs".into(), latency_ms.to_string());
        metadata.insert("strategy".into(), decision.strategy.clone());
        if attempts.len() > 1 {
            metadata.insert("attempts".into(), attempts.join(","));
        }
        if !response.notes.is_empty() {
            metadata.insert("adapterNotes".into(), response.notes.join(","));
        }

        let body = InferenceResponse {
            text: response.text,
            model: key,
            provider: provider_id.clone(),
            usage,
            cost: charged,
            finish_reason: response.finish_reason,
            tool_calls: response.tool_calls.iter().map(ToolCallOut::from).collect(),
            metadata,
        };

        let value = serde_json::to_value(&body)
            .unwrap_or_else(|_| serde_json::json!({ "text": body.text }));
        transform::standardize_inference_response(value)
    }

    fn record_dispatch_failure(
        &self,
        decision: &Decision,
        candidate: &Candidate,
        error: &GatewayError,
        latency_ms: u64,
        meta: &RequestMeta,
    ) {
        let provider_id = &candidate.provider.id;
        warn!(provider = %provider_id, kind = error.kind(), "Dispatch failed");
        if error.counts_against_circuit() {
            self.breakers.record_failure(provider_id);
        }
        if let GatewayError::ProviderRateLimited { retry_after_ms, .. } = error {
            let wait = Duration::from_millis(retry_after_ms.unwrap_or(30_000));
            self.rate_exhausted_until
                .insert(provider_id.clone(), Instant::now() + wait);
        }
        self.router.on_result(
            decision,
            &RouteOutcome {
                provider: provider_id.clone(),
                model: candidate.model.id.clone(),
                success: false,
                latency_ms: latency_ms as f64,
                cost: 0.0,
                tokens_per_sec: 0.0,
                quality_feedback: None,
            },
        );
        self.limiter
            .observe_outcome(meta.principal.rate_subject(), true, latency_ms as f64);
        self.metrics.record_dispatch(provider_id, false, 0, 0.0);
        self.events.publish(GatewayEvent::ProviderFailed {
            provider: provider_id.clone(),
            kind: error.kind().to_string(),
            timestamp: Utc::now(),
        });
    }

    fn deny(
        &self,
        verdict: RateLimitVerdict,
        subject: String,
        request_id: String,
        mut headers: Vec<(&'static str, String)>,
    ) -> Box<Failure> {
        let retry_after = verdict.retry_after.unwrap_or(Duration::from_secs(1));
        headers.push(("Retry-After", retry_after.as_secs().max(1).to_string()));
        self.metrics.incr_errors();
        self.events.publish(GatewayEvent::RateLimitDenied {
            subject,
            bucket: verdict.denied_by.clone().unwrap_or_default(),
            retry_after_ms: retry_after.as_millis() as u64,
            timestamp: Utc::now(),
        });
        Box::new(Failure {
            error: GatewayError::RateLimited {
                reason: verdict
                    .denied_by
                    .unwrap_or_else(|| "rate limit".into()),
                retry_after_ms: retry_after.as_millis() as u64,
            },
            request_id,
            attempts: Vec::new(),
            headers,
        })
    }

    fn fail(
        &self,
        error: GatewayError,
        request_id: String,
        attempts: Vec<String>,
        mut headers: Vec<(&'static str, String)>,
    ) -> Box<Failure> {
        if let Some(retry_ms) = error.retry_after_ms() {
            headers.push(("Retry-After", (retry_ms / 1_000).max(1).to_string()));
        }
        Box::new(Failure {
            error,
            request_id,
            attempts,
            headers,
        })
    }
}

/// When selection finds nothing because every matching provider has an
/// open circuit, the caller-visible failure is the circuit refusal, not
/// a missing route.
fn select_error(ctx: &RouteContext, error: GatewayError) -> GatewayError {
    match error {
        GatewayError::NotFound(_) if !ctx.circuit_open.is_empty() => {
            GatewayError::ProviderUnavailable {
                provider: ctx
                    .circuit_open
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_default(),
                message: "circuit open".into(),
            }
        }
        other => other,
    }
}

fn flatten_timeout<T>(
    result: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    provider: &str,
) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(GatewayError::ProviderTimeout {
            provider: provider.to_string(),
            elapsed_ms: 0,
        }),
    }
}
