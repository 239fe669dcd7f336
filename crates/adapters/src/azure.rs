//! Azure OpenAI adapter (`azure_openai` dialect).
//!
//! Same wire shape as OpenAI with three differences: the credential goes
//! in an `api-key` header, the model is addressed as a deployment in the
//! URL path, and every call carries an `api-version` query parameter.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::provider::ProviderRecord;
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{EmbeddingResponse, StreamFrame};

use crate::classify::{classify_response, classify_transport, parse_retry_after};
use crate::openai::{build_chat_body, decode_chat_response, decode_embedding_response, spawn_sse_relay};
use crate::sign::{Credentials, managed_identity_token};
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

const API_VERSION: &str = "2024-06-01";

pub struct AzureOpenAiAdapter {
    record: Arc<ProviderRecord>,
    credentials: Credentials,
    client: reqwest::Client,
}

impl AzureOpenAiAdapter {
    pub fn new(record: Arc<ProviderRecord>, credentials: Credentials) -> Result<Self> {
        if record.base_url.is_empty() {
            return Err(GatewayError::Internal(format!(
                "provider '{}' needs an Azure endpoint URL",
                record.id
            )));
        }
        Ok(Self {
            record,
            credentials,
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{deployment}/{operation}?api-version={API_VERSION}",
            self.record.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        // api-key credential when configured, host managed identity
        // otherwise
        builder = match &self.credentials.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder.header(
                "Authorization",
                format!("Bearer {}", managed_identity_token(provider)?),
            ),
        };

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %provider, status, "Azure OpenAI error");
            return Err(classify_response(provider, status, &body, retry_after));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for AzureOpenAiAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let (body, notes) = build_chat_body(request, &ctx.model, true, false);
        debug!(provider = %self.record.id, deployment = %ctx.model, "Sending completion request");

        let url = self.deployment_url(&ctx.model, "chat/completions");
        let response = self.send(&url, &body).await?;
        let api = response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            })?;
        decode_chat_response(&self.record.id, api, notes)
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        let (body, _notes) = build_chat_body(request, &ctx.model, true, true);
        debug!(provider = %self.record.id, deployment = %ctx.model, "Sending streaming request");

        let url = self.deployment_url(&ctx.model, "chat/completions");
        let response = self.send(&url, &body).await?;
        Ok(spawn_sse_relay(self.record.id.clone(), response))
    }

    async fn embed(&self, texts: &[String], ctx: &AdapterContext) -> Result<EmbeddingResponse> {
        let body = serde_json::json!({ "input": texts });
        let url = self.deployment_url(&ctx.model, "embeddings");
        let response = self.send(&url, &body).await?;
        decode_embedding_response(&self.record.id, response).await
    }

    async fn health(&self) -> Result<HealthStatus> {
        // No cheap unauthenticated probe on Azure; a HEAD to the
        // endpoint root establishes reachability.
        let started = std::time::Instant::now();
        let response = self
            .client
            .head(self.record.base_url.trim_end_matches('/'))
            .send()
            .await
            .map_err(|e| classify_transport(&self.record.id, &e))?;
        Ok(HealthStatus {
            ok: !response.status().is_server_error(),
            latency_ms: started.elapsed().as_millis() as u64,
            rate_remaining: None,
        })
    }

    fn estimate_cost(&self, request: &InferenceRequest) -> f64 {
        self.record.estimate_cost(
            request.estimated_prompt_tokens(),
            request.max_tokens.unwrap_or(256),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
