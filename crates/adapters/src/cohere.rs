//! Cohere adapter (`cohere_chat` / `cohere_embed` / `cohere_rerank`).
//!
//! Uses the v2 API. Chat carries the system prompt inside the message
//! list but with Cohere's own role names; embed and rerank are native
//! capabilities other dialects lack.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::message::{ChatMessage, Role, ToolCall, ToolDefinition};
use llmrouter_core::provider::ProviderRecord;
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{EmbeddingResponse, FinishReason, ScoredDocument, StreamFrame, Usage};

use crate::classify::{classify_response, classify_transport, parse_retry_after};
use crate::sign::Credentials;
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

pub struct CohereAdapter {
    record: Arc<ProviderRecord>,
    credentials: Credentials,
    client: reqwest::Client,
}

impl CohereAdapter {
    pub fn new(record: Arc<ProviderRecord>, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            record,
            credentials,
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/{path}", self.record.base_url.trim_end_matches('/'))
    }

    fn build_chat_body(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
        stream: bool,
    ) -> serde_json::Value {
        let messages = request.effective_messages();
        let mut body = serde_json::json!({
            "model": ctx.model,
            "messages": to_api_messages(&messages),
            "stream": stream,
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = request.top_p {
            body["p"] = serde_json::json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            body["k"] = serde_json::json!(top_k);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        if request.response_format == Some(llmrouter_core::message::ResponseFormat::JsonObject) {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    async fn send(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let key = self.credentials.require_api_key(provider)?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
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
            warn!(provider = %provider, status, "Cohere API error");
            return Err(classify_response(provider, status, &body, retry_after));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for CohereAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let body = self.build_chat_body(request, ctx, false);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending chat request");

        let response = self.send(&self.url("chat"), &body).await?;
        let api: ChatResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for item in api.message.content.unwrap_or_default() {
            if let Some(t) = item.text {
                text.push_str(&t);
            }
        }
        for tc in api.message.tool_calls.unwrap_or_default() {
            tool_calls.push(ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            });
        }

        let usage = api
            .usage
            .map(|u| Usage::new(u.tokens.input_tokens, u.tokens.output_tokens))
            .unwrap_or_default();

        Ok(AdapterResponse {
            text,
            tool_calls,
            finish_reason: map_finish_reason(api.finish_reason.as_deref()),
            usage,
            model: ctx.model.clone(),
            notes: Vec::new(),
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        let body = self.build_chat_body(request, ctx, true);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending streaming chat request");

        let response = self.send(&self.url("chat"), &body).await?;
        let provider = self.record.id.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage: Option<Usage> = None;
            let mut finish: Option<FinishReason> = None;

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GatewayError::UpstreamProtocol {
                                provider: provider.clone(),
                                message: format!("stream interrupted: {e}"),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let event: serde_json::Value = match serde_json::from_str(data.trim()) {
                        Ok(v) => v,
                        Err(e) => {
                            trace!(error = %e, "Ignoring unparseable Cohere SSE line");
                            continue;
                        }
                    };

                    match event["type"].as_str().unwrap_or("") {
                        "content-delta" => {
                            if let Some(text) =
                                event["delta"]["message"]["content"]["text"].as_str()
                            {
                                if tx.send(Ok(StreamFrame::delta(text))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "message-end" => {
                            if let Some(reason) = event["delta"]["finish_reason"].as_str() {
                                finish = Some(map_finish_reason(Some(reason)));
                            }
                            let tokens = &event["delta"]["usage"]["tokens"];
                            if tokens.is_object() {
                                usage = Some(Usage::new(
                                    tokens["input_tokens"].as_u64().unwrap_or(0) as u32,
                                    tokens["output_tokens"].as_u64().unwrap_or(0) as u32,
                                ));
                            }
                            let _ = tx
                                .send(Ok(StreamFrame::terminal(
                                    finish.unwrap_or(FinishReason::Stop),
                                    usage,
                                )))
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamFrame::terminal(
                    finish.unwrap_or(FinishReason::Error),
                    usage,
                )))
                .await;
        });

        Ok(rx)
    }

    async fn embed(&self, texts: &[String], ctx: &AdapterContext) -> Result<EmbeddingResponse> {
        let body = serde_json::json!({
            "model": ctx.model,
            "texts": texts,
            "input_type": "search_document",
            "embedding_types": ["float"],
        });
        debug!(provider = %self.record.id, model = %ctx.model, count = texts.len(), "Sending embed request");

        let response = self.send(&self.url("embed"), &body).await?;
        let api: EmbedResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse embed response: {e}"),
            }
        })?;

        Ok(EmbeddingResponse {
            embeddings: api.embeddings.float,
            model: ctx.model.clone(),
            provider: self.record.id.clone(),
            usage: api
                .meta
                .and_then(|m| m.billed_units)
                .map(|b| Usage::new(b.input_tokens.unwrap_or(0), 0))
                .unwrap_or_default(),
        })
    }

    async fn rerank(
        &self,
        query: &str,
        docs: &[String],
        ctx: &AdapterContext,
    ) -> Result<Vec<ScoredDocument>> {
        let body = serde_json::json!({
            "model": ctx.model,
            "query": query,
            "documents": docs,
        });
        debug!(provider = %self.record.id, model = %ctx.model, docs = docs.len(), "Sending rerank request");

        let response = self.send(&self.url("rerank"), &body).await?;
        let api: RerankResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse rerank response: {e}"),
            }
        })?;

        Ok(api
            .results
            .into_iter()
            .map(|r| ScoredDocument {
                index: r.index,
                score: r.relevance_score,
            })
            .collect())
    }

    async fn health(&self) -> Result<HealthStatus> {
        let url = format!("{}/v1/models", self.record.base_url.trim_end_matches('/'));
        let key = self.credentials.require_api_key(&self.record.id)?;
        let started = std::time::Instant::now();

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {key}"))
            .send()
            .await
            .map_err(|e| classify_transport(&self.record.id, &e))?;

        Ok(HealthStatus {
            ok: response.status().is_success(),
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

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("COMPLETE") | None => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("TOOL_CALL") => FinishReason::ToolCall,
        Some(_) => FinishReason::Stop,
    }
}

fn to_api_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            serde_json::json!({ "role": role, "content": m.content })
        })
        .collect()
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessageOut,
    #[serde(default)]
    finish_reason: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: Option<Vec<ContentItem>>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    tokens: TokenCounts,
}

#[derive(Debug, Deserialize)]
struct TokenCounts {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: EmbedVectors,
    meta: Option<EmbedMeta>,
}

#[derive(Debug, Deserialize)]
struct EmbedVectors {
    float: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct EmbedMeta {
    billed_units: Option<BilledUnits>,
}

#[derive(Debug, Deserialize)]
struct BilledUnits {
    input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}
