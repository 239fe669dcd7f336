//! Local GGUF runner adapter (`gguf_local` dialect).
//!
//! Speaks to a llama.cpp-style runner over HTTP: OpenAI-shape chat at
//! `/v1/chat/completions`, a `/health` probe, and the runner's model
//! management endpoints. The runner has no native function calling, so
//! tool requests go through the synthesized-prompt path.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::provider::ProviderRecord;
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{FinishReason, StreamFrame};

use crate::classify::{classify_response, classify_transport};
use crate::compat;
use crate::openai::{build_chat_body, decode_chat_response, spawn_sse_relay};
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

pub struct LocalGgufAdapter {
    record: Arc<ProviderRecord>,
    client: reqwest::Client,
}

impl LocalGgufAdapter {
    pub fn new(record: Arc<ProviderRecord>) -> Result<Self> {
        Ok(Self {
            record,
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.record.base_url.trim_end_matches('/'))
    }

    async fn send(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %provider, status, "Local runner error");
            return Err(classify_response(provider, status, &body, None));
        }
        Ok(response)
    }

    /// Ask the runner to load a model into memory.
    pub async fn load_model(&self, model_id: &str) -> Result<()> {
        let body = serde_json::json!({ "model": model_id });
        self.send(&self.url("/models/load"), &body).await?;
        info!(provider = %self.record.id, model = model_id, "Local model loaded");
        Ok(())
    }

    /// Ask the runner to unload a model.
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        let provider = &self.record.id;
        let response = self
            .client
            .delete(self.url(&format!("/models/{model_id}")))
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;
        let status = response.status().as_u16();
        if status != 200 && status != 204 {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(provider, status, &body, None));
        }
        info!(provider = %provider, model = model_id, "Local model unloaded");
        Ok(())
    }
}

#[async_trait]
impl Adapter for LocalGgufAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let (body, notes) = build_chat_body(request, &ctx.model, false, false);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending completion to local runner");

        let response = self.send(&self.url("/v1/chat/completions"), &body).await?;
        let api = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            })?;

        let mut out = decode_chat_response(&self.record.id, api, notes)?;
        if out.tool_calls.is_empty() && !request.tools.is_empty() {
            if let Some(call) = compat::parse_tool_call_from_text(&out.text) {
                out.tool_calls.push(call);
                out.text = String::new();
                out.finish_reason = FinishReason::ToolCall;
                out.notes.push("parsed_synthesized_tool_call".into());
            }
        }
        Ok(out)
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        let (body, _notes) = build_chat_body(request, &ctx.model, false, true);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending streaming completion to local runner");

        let response = self.send(&self.url("/v1/chat/completions"), &body).await?;
        Ok(spawn_sse_relay(self.record.id.clone(), response))
    }

    async fn health(&self) -> Result<HealthStatus> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| classify_transport(&self.record.id, &e))?;
        Ok(HealthStatus {
            ok: response.status().is_success(),
            latency_ms: started.elapsed().as_millis() as u64,
            rate_remaining: None,
        })
    }

    fn estimate_cost(&self, _request: &InferenceRequest) -> f64 {
        // Local inference has no metered cost
        0.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrouter_core::provider::{AuthScheme, Dialect};
    use std::collections::BTreeSet;

    fn adapter() -> LocalGgufAdapter {
        LocalGgufAdapter::new(Arc::new(ProviderRecord {
            id: "p_local".into(),
            base_url: "http://localhost:8080/".into(),
            dialect: Dialect::GgufLocal,
            auth: AuthScheme::None,
            capabilities: BTreeSet::new(),
            input_cost_per_m: 0.0,
            output_cost_per_m: 0.0,
            rate_budget_per_min: 60,
            models: Vec::new(),
            region: None,
            compliance_tags: Vec::new(),
            version: 0,
        }))
        .unwrap()
    }

    #[test]
    fn urls_are_rooted_at_the_runner() {
        let adapter = adapter();
        assert_eq!(
            adapter.url("/v1/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(adapter.url("/models/llama"), "http://localhost:8080/models/llama");
    }

    #[test]
    fn local_inference_is_free() {
        let adapter = adapter();
        let request = InferenceRequest::from_prompt("hello");
        assert_eq!(adapter.estimate_cost(&request), 0.0);
    }
}
