//! Provider and model records — the registry's row types.
//!
//! A `ProviderRecord` describes one upstream backend: where it lives, which
//! wire dialect it speaks, how to authenticate, what it can do, and what it
//! charges. Records are immutable once registered; admin updates publish a
//! new record with a bumped version (see `registry`).

use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// A provider's wire protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenaiChat,
    AnthropicMessages,
    AzureOpenai,
    BedrockInvoke,
    VertexPredict,
    Mistral,
    Together,
    Fireworks,
    Groq,
    CohereChat,
    CohereEmbed,
    CohereRerank,
    Openrouter,
    Huggingface,
    GgufLocal,
}

impl Dialect {
    /// Whether this dialect natively understands tool/function schemas.
    pub fn native_function_calling(&self) -> bool {
        !matches!(self, Self::Huggingface | Self::GgufLocal)
    }

    /// Whether this dialect carries the system prompt as a top-level
    /// field rather than inside the message list.
    pub fn system_as_top_level(&self) -> bool {
        matches!(
            self,
            Self::AnthropicMessages | Self::Mistral | Self::CohereChat
        )
    }
}

/// How requests to a provider are authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scheme")]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// A custom header, e.g. `x-api-key`.
    HeaderKey { header: String },
    /// AWS-style signed request.
    SigV4 { region: String, service: String },
    /// Service-account JWT exchanged for a short-lived OAuth token.
    ServiceAccountJwt { token_uri: String, scope: String },
    /// Token sourced from the host environment (IMDS and friends).
    ManagedIdentity,
    /// Unauthenticated (local runners).
    None,
}

/// A declared provider capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    Chat,
    Streaming,
    Embeddings,
    FunctionCalling,
    Vision,
    Rerank,
}

/// A model hosted by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model id as the provider knows it.
    pub id: String,

    /// Maximum context length in tokens.
    pub context_window: u32,

    /// Capabilities, when narrower than the provider's.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Declared quality score in [0, 1].
    pub quality: f64,

    /// Whether the model is currently loaded. Only meaningful for
    /// local-inference providers; remote models are always `true`.
    #[serde(default = "default_loaded")]
    pub loaded: bool,
}

fn default_loaded() -> bool {
    true
}

/// A registered upstream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Stable identifier, unique across the registry.
    pub id: String,

    /// Endpoint base URL.
    pub base_url: String,

    pub dialect: Dialect,

    pub auth: AuthScheme,

    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,

    /// Declared cost per 1M input tokens, USD.
    pub input_cost_per_m: f64,

    /// Declared cost per 1M output tokens, USD.
    pub output_cost_per_m: f64,

    /// Declared request budget per minute.
    pub rate_budget_per_min: u32,

    pub models: Vec<ModelRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compliance_tags: Vec<String>,

    /// Bumped on every admin update.
    #[serde(default)]
    pub version: u32,
}

impl ProviderRecord {
    pub fn model(&self, id: &str) -> Option<&ModelRecord> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Effective capabilities of a model: the model's own set when
    /// declared, otherwise the provider's.
    pub fn model_capabilities<'a>(&'a self, model: &'a ModelRecord) -> &'a BTreeSet<Capability> {
        if model.capabilities.is_empty() {
            &self.capabilities
        } else {
            &model.capabilities
        }
    }

    /// Estimated USD cost of a request against this provider.
    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 * self.input_cost_per_m
            + completion_tokens as f64 * self.output_cost_per_m)
            / 1_000_000.0
    }
}

/// Observed per-model performance over a rolling window.
///
/// Latency keeps a bounded sample ring for the p75 estimate; success is a
/// rolling boolean window with Laplace smoothing. With no history the
/// reliability prior is 0.8.
#[derive(Debug, Clone)]
pub struct PerfWindow {
    latencies_ms: VecDeque<f64>,
    outcomes: VecDeque<bool>,
    window: usize,
    ema_latency_ms: Option<f64>,
    ema_cost: Option<f64>,
    ema_tps: Option<f64>,
    alpha: f64,
}

impl PerfWindow {
    pub const DEFAULT_WINDOW: usize = 500;
    const DEFAULT_RELIABILITY: f64 = 0.8;

    pub fn new(window: usize) -> Self {
        Self {
            latencies_ms: VecDeque::with_capacity(window.min(1024)),
            outcomes: VecDeque::with_capacity(window.min(1024)),
            window,
            ema_latency_ms: None,
            ema_cost: None,
            ema_tps: None,
            alpha: 0.1,
        }
    }

    /// Record one completed request.
    pub fn record(&mut self, success: bool, latency_ms: f64, cost: f64, tokens_per_sec: f64) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);

        if success {
            if self.latencies_ms.len() == self.window {
                self.latencies_ms.pop_front();
            }
            self.latencies_ms.push_back(latency_ms);
            self.ema_latency_ms = Some(ema(self.ema_latency_ms, latency_ms, self.alpha));
            self.ema_cost = Some(ema(self.ema_cost, cost, self.alpha));
            if tokens_per_sec > 0.0 {
                self.ema_tps = Some(ema(self.ema_tps, tokens_per_sec, self.alpha));
            }
        }
    }

    /// Success-rate EMA over the rolling window, Laplace-smoothed.
    pub fn reliability(&self) -> f64 {
        if self.outcomes.is_empty() {
            return Self::DEFAULT_RELIABILITY;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count() as f64;
        (successes + 1.0) / (self.outcomes.len() as f64 + 2.0)
    }

    /// 75th-percentile observed latency, ms. `None` without samples.
    pub fn p75_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = (sorted.len() * 3).saturating_sub(1) / 4;
        Some(sorted[idx])
    }

    pub fn ema_latency_ms(&self) -> Option<f64> {
        self.ema_latency_ms
    }

    pub fn ema_cost(&self) -> Option<f64> {
        self.ema_cost
    }

    pub fn observations(&self) -> usize {
        self.outcomes.len()
    }
}

impl Default for PerfWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

fn ema(prev: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match prev {
        Some(p) => p + alpha * (sample - p),
        None => sample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderRecord {
        ProviderRecord {
            id: id.into(),
            base_url: "https://api.example.com/v1".into(),
            dialect: Dialect::OpenaiChat,
            auth: AuthScheme::Bearer,
            capabilities: [Capability::Chat, Capability::Streaming].into(),
            input_cost_per_m: 2.5,
            output_cost_per_m: 10.0,
            rate_budget_per_min: 600,
            models: vec![ModelRecord {
                id: "gpt-4o".into(),
                context_window: 128_000,
                capabilities: BTreeSet::new(),
                quality: 0.92,
                loaded: true,
            }],
            region: None,
            compliance_tags: Vec::new(),
            version: 0,
        }
    }

    #[test]
    fn cost_estimate_per_million() {
        let p = provider("p");
        // (1000 * 2.5 + 500 * 10.0) / 1M = 0.0075
        let cost = p.estimate_cost(1000, 500);
        assert!((cost - 0.0075).abs() < 1e-12);
    }

    #[test]
    fn model_capabilities_fall_back_to_provider() {
        let p = provider("p");
        let m = &p.models[0];
        assert!(p.model_capabilities(m).contains(&Capability::Chat));
    }

    #[test]
    fn dialect_traits() {
        assert!(Dialect::AnthropicMessages.system_as_top_level());
        assert!(!Dialect::OpenaiChat.system_as_top_level());
        assert!(!Dialect::GgufLocal.native_function_calling());
    }

    #[test]
    fn reliability_prior_without_history() {
        let w = PerfWindow::default();
        assert!((w.reliability() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn reliability_uses_laplace_smoothing() {
        let mut w = PerfWindow::new(10);
        for _ in 0..4 {
            w.record(true, 100.0, 0.001, 50.0);
        }
        w.record(false, 0.0, 0.0, 0.0);
        // (4 + 1) / (5 + 2)
        assert!((w.reliability() - 5.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn p75_latency_from_ring() {
        let mut w = PerfWindow::new(100);
        for ms in [100.0, 200.0, 300.0, 400.0] {
            w.record(true, ms, 0.0, 0.0);
        }
        assert_eq!(w.p75_latency_ms(), Some(300.0));
        assert!(PerfWindow::default().p75_latency_ms().is_none());
    }

    #[test]
    fn window_is_bounded() {
        let mut w = PerfWindow::new(5);
        for _ in 0..20 {
            w.record(true, 10.0, 0.0, 0.0);
        }
        assert_eq!(w.observations(), 5);
    }
}
