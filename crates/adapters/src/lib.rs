//! Provider adapter layer.
//!
//! Every upstream dialect implements the same `Adapter` contract: encode
//! the normalized request into the provider's wire format, decode the
//! reply (or stream) back into normalized shapes, classify failures into
//! the gateway error taxonomy. Nothing above this layer ever sees a
//! provider wire format.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod classify;
pub mod cohere;
pub mod compat;
pub mod local;
pub mod openai;
pub mod scripted;
pub mod sign;
pub mod vertex;

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::message::ToolCall;
use llmrouter_core::provider::{Dialect, ProviderRecord};
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{EmbeddingResponse, FinishReason, ScoredDocument, StreamFrame, Usage};

pub use scripted::ScriptedAdapter;
pub use sign::Credentials;

/// Per-dispatch context handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub request_id: String,
    /// The model chosen by the router.
    pub model: String,
    /// Absolute deadline for this dispatch attempt.
    pub deadline: Option<Instant>,
}

impl AdapterContext {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// What an adapter returns before the pipeline enriches it with cost,
/// latency, and routing metadata.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    /// Model id as reported by the upstream (may carry a version suffix).
    pub model: String,
    /// Fix-ups applied during translation, e.g. alternation repair.
    pub notes: Vec<String>,
}

/// Result of a provider health probe.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub ok: bool,
    pub latency_ms: u64,
    /// Remaining request budget reported by the provider, when exposed.
    pub rate_remaining: Option<u32>,
}

/// The adapter contract. One implementation per wire dialect.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The provider record this adapter dispatches for.
    fn provider_id(&self) -> &str;

    /// One-shot completion.
    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse>;

    /// Streamed completion: a finite, non-restartable frame sequence.
    /// Exactly one frame (the last) carries a finish reason.
    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>>;

    /// Embed a batch of texts. Not every dialect supports this.
    async fn embed(&self, _texts: &[String], _ctx: &AdapterContext) -> Result<EmbeddingResponse> {
        Err(GatewayError::InvalidRequest {
            message: format!("provider '{}' does not support embeddings", self.provider_id()),
            details: None,
        })
    }

    /// Rerank documents against a query. Optional capability.
    async fn rerank(
        &self,
        _query: &str,
        _docs: &[String],
        _ctx: &AdapterContext,
    ) -> Result<Vec<ScoredDocument>> {
        Err(GatewayError::InvalidRequest {
            message: format!("provider '{}' does not support rerank", self.provider_id()),
            details: None,
        })
    }

    /// Probe provider reachability.
    async fn health(&self) -> Result<HealthStatus>;

    /// Estimated request cost in USD, from declared pricing.
    fn estimate_cost(&self, request: &InferenceRequest) -> f64;

    /// Escape hatch for dialect-specific admin operations (local model
    /// load/unload).
    fn as_any(&self) -> &dyn Any;
}

/// Build the adapter for a provider record.
pub fn build_adapter(
    record: Arc<ProviderRecord>,
    credentials: Credentials,
) -> Result<Arc<dyn Adapter>> {
    let adapter: Arc<dyn Adapter> = match record.dialect {
        Dialect::OpenaiChat
        | Dialect::Mistral
        | Dialect::Together
        | Dialect::Fireworks
        | Dialect::Groq
        | Dialect::Openrouter
        | Dialect::Huggingface => Arc::new(openai::OpenAiAdapter::new(record, credentials)?),
        Dialect::AnthropicMessages => {
            Arc::new(anthropic::AnthropicAdapter::new(record, credentials)?)
        }
        Dialect::AzureOpenai => Arc::new(azure::AzureOpenAiAdapter::new(record, credentials)?),
        Dialect::BedrockInvoke => Arc::new(bedrock::BedrockAdapter::new(record, credentials)?),
        Dialect::VertexPredict => Arc::new(vertex::VertexAdapter::new(record, credentials)?),
        Dialect::CohereChat | Dialect::CohereEmbed | Dialect::CohereRerank => {
            Arc::new(cohere::CohereAdapter::new(record, credentials)?)
        }
        Dialect::GgufLocal => Arc::new(local::LocalGgufAdapter::new(record)?),
    };
    Ok(adapter)
}

/// Shared HTTP client construction: one pool per adapter, request
/// timeouts enforced per call from the context.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))
}

pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_remaining_counts_down() {
        let ctx = AdapterContext::new("r1", "m1")
            .with_deadline(Instant::now() + Duration::from_secs(10));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(10));
        assert!(remaining > Duration::from_secs(9));
        assert!(AdapterContext::new("r2", "m").remaining().is_none());
    }
}
