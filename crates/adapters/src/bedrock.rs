//! AWS Bedrock adapter (`bedrock_invoke` dialect).
//!
//! Requests are SigV4-signed `InvokeModel` / `InvokeModelWithResponseStream`
//! calls carrying an Anthropic-messages payload (the model family this
//! gateway routes through Bedrock). Streaming responses arrive as the AWS
//! event-stream binary framing; the decoder below handles the subset the
//! runtime emits: `chunk` events whose payload is base64 JSON.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::message::ToolCall;
use llmrouter_core::provider::{AuthScheme, ProviderRecord};
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{FinishReason, StreamFrame, Usage};

use crate::classify::{classify_response, classify_transport};
use crate::compat;
use crate::sign::{Credentials, sigv4_headers};
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

const ANTHROPIC_BEDROCK_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct BedrockAdapter {
    record: Arc<ProviderRecord>,
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
    client: reqwest::Client,
}

impl BedrockAdapter {
    pub fn new(record: Arc<ProviderRecord>, credentials: Credentials) -> Result<Self> {
        let (region, service) = match &record.auth {
            AuthScheme::SigV4 { region, service } => (region.clone(), service.clone()),
            other => {
                return Err(GatewayError::Internal(format!(
                    "provider '{}' has auth scheme {other:?}, expected SigV4",
                    record.id
                )));
            }
        };
        let access_key = credentials.aws_access_key_id.clone().ok_or_else(|| {
            GatewayError::Internal(format!("provider '{}' is missing AWS access key", record.id))
        })?;
        let secret_key = credentials.aws_secret_access_key.clone().ok_or_else(|| {
            GatewayError::Internal(format!("provider '{}' is missing AWS secret key", record.id))
        })?;

        Ok(Self {
            record,
            access_key,
            secret_key,
            region: credentials.aws_region.clone().unwrap_or(region),
            service,
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn base_url(&self) -> String {
        if self.record.base_url.is_empty() {
            format!("https://bedrock-runtime.{}.amazonaws.com", self.region)
        } else {
            self.record.base_url.trim_end_matches('/').to_string()
        }
    }

    fn build_body(&self, request: &InferenceRequest) -> (serde_json::Value, Vec<String>) {
        let mut notes = Vec::new();
        let messages = request.effective_messages();
        let (system, rest) = compat::extract_system(&messages);
        let (ordered, repaired) = compat::enforce_alternation(&rest);
        if repaired {
            notes.push("alternation_repaired".into());
        }

        let api_messages: Vec<serde_json::Value> = ordered
            .iter()
            .map(|m| {
                let role = match m.role {
                    llmrouter_core::message::Role::Assistant => "assistant",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "content": m.content })
            })
            .collect();

        let mut body = serde_json::json!({
            "anthropic_version": ANTHROPIC_BEDROCK_VERSION,
            "messages": api_messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.min(1.0),
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop_sequences);
        }
        (body, notes)
    }

    async fn send(&self, model: &str, operation: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let payload = serde_json::to_vec(body)
            .map_err(|e| GatewayError::Internal(format!("body serialization failed: {e}")))?;

        let url_str = format!("{}/model/{model}/{operation}", self.base_url());
        let url: reqwest::Url = url_str
            .parse()
            .map_err(|e| GatewayError::Internal(format!("bad Bedrock URL '{url_str}': {e}")))?;

        let mut builder = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json");
        for (name, value) in sigv4_headers(
            &self.access_key,
            &self.secret_key,
            &self.region,
            &self.service,
            "POST",
            &url,
            &payload,
            Utc::now(),
        ) {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(payload)
            .send()
            .await
            .map_err(|e| classify_transport(provider, &e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            warn!(provider = %provider, status, "Bedrock error");
            return Err(classify_response(provider, status, &body, None));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for BedrockAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let (body, notes) = self.build_body(request);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending InvokeModel request");

        let response = self.send(&ctx.model, "invoke", &body).await?;
        let api: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = api["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                    Some("tool_use") => tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].to_string(),
                    }),
                    _ => {}
                }
            }
        }

        Ok(AdapterResponse {
            text,
            tool_calls,
            finish_reason: map_stop_reason(api["stop_reason"].as_str()),
            usage: Usage::new(
                api["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                api["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
            ),
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
        debug!(provider = %self.record.id, model = %ctx.model, "Sending InvokeModelWithResponseStream request");

        let response = self
            .send(&ctx.model, "invoke-with-response-stream", &body)
            .await?;
        let provider = self.record.id.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
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
                buffer.extend_from_slice(&bytes);

                while let Some((frame, consumed)) = decode_event_frame(&buffer) {
                    buffer.drain(..consumed);
                    let Some(event) = frame else { continue };

                    match event["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            input_tokens = event["message"]["usage"]["input_tokens"]
                                .as_u64()
                                .unwrap_or(0) as u32;
                        }
                        "content_block_delta" => {
                            if let Some(text) = event["delta"]["text"].as_str() {
                                if tx.send(Ok(StreamFrame::delta(text))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                                finish = Some(map_stop_reason(Some(reason)));
                            }
                            if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                                output_tokens = out as u32;
                            }
                        }
                        "message_stop" => {
                            let _ = tx
                                .send(Ok(StreamFrame::terminal(
                                    finish.unwrap_or(FinishReason::Stop),
                                    Some(Usage::new(input_tokens, output_tokens)),
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
                    Some(Usage::new(input_tokens, output_tokens)),
                )))
                .await;
        });

        Ok(rx)
    }

    async fn health(&self) -> Result<HealthStatus> {
        // Reachability of the regional endpoint; an unsigned GET yields a
        // 4xx from the service, which still proves the region is up.
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(self.base_url())
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
            request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCall,
        Some(_) => FinishReason::Stop,
    }
}

/// Decode one AWS event-stream frame from the front of `buffer`.
///
/// Returns `None` while the buffer holds less than a full frame;
/// otherwise `(payload, consumed)` where `payload` is the decoded inner
/// JSON for `chunk` events (and `None` for other event types, which are
/// skipped). Frame layout: 4B total length, 4B header length, 4B prelude
/// CRC, headers, payload, 4B message CRC.
fn decode_event_frame(buffer: &[u8]) -> Option<(Option<serde_json::Value>, usize)> {
    if buffer.len() < 12 {
        return None;
    }
    let total_len = u32::from_be_bytes(buffer[0..4].try_into().ok()?) as usize;
    if total_len < 16 || buffer.len() < total_len {
        return None;
    }
    let header_len = u32::from_be_bytes(buffer[4..8].try_into().ok()?) as usize;

    let payload_start = 12 + header_len;
    let payload_end = total_len - 4;
    if payload_start > payload_end || payload_end > buffer.len() {
        // Malformed prelude; skip the declared frame to resynchronize
        return Some((None, total_len.min(buffer.len())));
    }

    let payload = &buffer[payload_start..payload_end];
    let envelope: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "Skipping non-JSON event-stream payload");
            return Some((None, total_len));
        }
    };

    // chunk events wrap the real payload in base64 under "bytes"
    let inner = envelope["bytes"]
        .as_str()
        .and_then(|b64| BASE64.decode(b64).ok())
        .and_then(|raw| serde_json::from_slice(&raw).ok());

    Some((inner, total_len))
}
