//! Vertex AI adapter (`vertex_predict` dialect).
//!
//! The record's base URL points at the publisher model collection
//! (`…/publishers/google/models`); the adapter appends
//! `{model}:generateContent` / `{model}:streamGenerateContent`. Requests
//! are authorized with a cached OAuth token minted from the configured
//! service-account key.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::message::{Role, ToolCall, ToolDefinition};
use llmrouter_core::provider::{AuthScheme, ProviderRecord};
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{FinishReason, StreamFrame, Usage};

use crate::classify::{classify_response, classify_transport, parse_retry_after};
use crate::compat;
use crate::sign::{Credentials, ServiceAccountKey, ServiceAccountTokenSource};
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

pub struct VertexAdapter {
    record: Arc<ProviderRecord>,
    tokens: ServiceAccountTokenSource,
    client: reqwest::Client,
}

impl VertexAdapter {
    pub fn new(record: Arc<ProviderRecord>, credentials: Credentials) -> Result<Self> {
        let (token_uri, scope) = match &record.auth {
            AuthScheme::ServiceAccountJwt { token_uri, scope } => {
                (token_uri.clone(), scope.clone())
            }
            other => {
                return Err(GatewayError::Internal(format!(
                    "provider '{}' has auth scheme {other:?}, expected service-account JWT",
                    record.id
                )));
            }
        };
        let key_path = credentials.credentials_file.as_deref().ok_or_else(|| {
            GatewayError::Internal(format!(
                "provider '{}' needs a service-account credentials file",
                record.id
            ))
        })?;
        let key = ServiceAccountKey::from_file(key_path)?;

        Ok(Self {
            record,
            tokens: ServiceAccountTokenSource::new(key, &token_uri, &scope),
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn model_url(&self, model: &str, operation: &str) -> String {
        format!(
            "{}/{model}:{operation}",
            self.record.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &InferenceRequest) -> (serde_json::Value, Vec<String>) {
        let mut notes = Vec::new();
        let messages = request.effective_messages();
        let (system, rest) = compat::extract_system(&messages);
        let (ordered, repaired) = compat::enforce_alternation(&rest);
        if repaired {
            notes.push("alternation_repaired".into());
        }

        let contents: Vec<serde_json::Value> = ordered
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation_config = serde_json::json!({
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = request.top_p {
            generation_config["topP"] = serde_json::json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            generation_config["topK"] = serde_json::json!(top_k);
        }
        if !request.stop_sequences.is_empty() {
            generation_config["stopSequences"] = serde_json::json!(request.stop_sequences);
        }
        if request.response_format == Some(llmrouter_core::message::ResponseFormat::JsonObject) {
            generation_config["responseMimeType"] = serde_json::json!("application/json");
        }

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = system {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!([{
                "functionDeclarations": to_function_declarations(&request.tools)
            }]);
        }
        (body, notes)
    }

    async fn send(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let token = self.tokens.token(&self.client).await?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
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
            warn!(provider = %provider, status, "Vertex API error");
            return Err(classify_response(provider, status, &body, retry_after));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for VertexAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let (body, notes) = self.build_body(request);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending generateContent request");

        let url = self.model_url(&ctx.model, "generateContent");
        let response = self.send(&url, &body).await?;
        let api: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;

        let candidate = api["candidates"]
            .get(0)
            .ok_or_else(|| GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: "no candidates in response".into(),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
                if let Some(call) = part.get("functionCall") {
                    tool_calls.push(ToolCall {
                        id: format!("vertex_{}", tool_calls.len()),
                        name: call["name"].as_str().unwrap_or("").to_string(),
                        arguments: call["args"].to_string(),
                    });
                }
            }
        }

        let usage = Usage::new(
            api["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            api["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0) as u32,
        );

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCall
        } else {
            map_finish_reason(candidate["finishReason"].as_str())
        };

        Ok(AdapterResponse {
            text,
            tool_calls,
            finish_reason,
            usage,
            model: ctx.model.clone(),
            notes,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        let (body, _notes) = self.build_body(request);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending streamGenerateContent request");

        let url = format!(
            "{}?alt=sse",
            self.model_url(&ctx.model, "streamGenerateContent")
        );
        let response = self.send(&url, &body).await?;
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
                            trace!(error = %e, "Ignoring unparseable Vertex SSE line");
                            continue;
                        }
                    };

                    if let Some(meta) = event.get("usageMetadata") {
                        usage = Some(Usage::new(
                            meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                            meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                        ));
                    }
                    let Some(candidate) = event["candidates"].get(0) else {
                        continue;
                    };
                    if let Some(reason) = candidate["finishReason"].as_str() {
                        finish = Some(map_finish_reason(Some(reason)));
                    }
                    if let Some(parts) = candidate["content"]["parts"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                if !text.is_empty()
                                    && tx.send(Ok(StreamFrame::delta(text))).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(StreamFrame::terminal(
                    finish.unwrap_or(FinishReason::Stop),
                    usage,
                )))
                .await;
        });

        Ok(rx)
    }

    async fn health(&self) -> Result<HealthStatus> {
        // Token minting exercises the auth path; reaching the endpoint
        // root proves network reachability.
        let started = std::time::Instant::now();
        let token = self.tokens.token(&self.client).await;
        Ok(HealthStatus {
            ok: token.is_ok(),
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
        Some("STOP") | None => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("PROHIBITED_CONTENT") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Stop,
    }
}

fn to_function_declarations(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("SAFETY")), FinishReason::ContentFilter);
    }

    #[test]
    fn function_declarations_shape() {
        let tools = vec![ToolDefinition {
            name: "lookup".into(),
            description: "Find a record".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let decls = to_function_declarations(&tools);
        assert_eq!(decls[0]["name"], "lookup");
        assert_eq!(decls[0]["parameters"]["type"], "object");
    }
}
