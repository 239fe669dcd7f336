//! Anthropic Messages API adapter (`anthropic_messages` dialect).
//!
//! Wire particulars handled here:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//! - Strict user/assistant alternation (repaired, and the repair noted)
//! - Native tool use via `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_delta` events

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::message::{ChatMessage, Role, ToolCall, ToolChoice, ToolChoiceMode, ToolDefinition};
use llmrouter_core::provider::ProviderRecord;
use llmrouter_core::request::InferenceRequest;
use llmrouter_core::response::{FinishReason, StreamFrame, Usage};

use crate::classify::{classify_response, classify_transport, parse_retry_after};
use crate::compat;
use crate::sign::Credentials;
use crate::{Adapter, AdapterContext, AdapterResponse, HealthStatus};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    record: Arc<ProviderRecord>,
    credentials: Credentials,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(record: Arc<ProviderRecord>, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            record,
            credentials,
            client: crate::http_client(crate::DEFAULT_HTTP_TIMEOUT)?,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.record.base_url.trim_end_matches('/'))
    }

    fn build_body(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
        stream: bool,
    ) -> (serde_json::Value, Vec<String>) {
        let mut notes = Vec::new();
        let messages = request.effective_messages();

        let (system, rest) = compat::extract_system(&messages);
        let (ordered, repaired) = compat::enforce_alternation(&rest);
        if repaired {
            notes.push("alternation_repaired".into());
        }

        let mut body = serde_json::json!({
            "model": ctx.model,
            "messages": to_api_messages(&ordered),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.min(1.0),
        });
        if stream {
            body["stream"] = serde_json::json!(true);
        }

        let mut system_parts: Vec<String> = system.into_iter().collect();
        if request.response_format == Some(llmrouter_core::message::ResponseFormat::JsonObject) {
            // No native JSON mode on this wire
            system_parts.push(compat::json_mode_preamble().to_string());
            notes.push("prompted_json_mode".into());
        }
        if !system_parts.is_empty() {
            body["system"] = serde_json::json!(system_parts.join("\n\n"));
        }

        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            body["top_k"] = serde_json::json!(top_k);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop_sequences);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Mode(ToolChoiceMode::Auto) => {
                        serde_json::json!({ "type": "auto" })
                    }
                    ToolChoice::Mode(ToolChoiceMode::Required) => {
                        serde_json::json!({ "type": "any" })
                    }
                    ToolChoice::Named(name) => {
                        serde_json::json!({ "type": "tool", "name": name })
                    }
                };
            }
        }

        (body, notes)
    }

    async fn send(&self, body: &serde_json::Value, sse: bool) -> Result<reqwest::Response> {
        let provider = &self.record.id;
        let key = self.credentials.require_api_key(provider)?;

        let mut builder = self
            .client
            .post(self.messages_url())
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if sse {
            builder = builder.header("Accept", "text/event-stream");
        }

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
            warn!(provider = %provider, status, "Anthropic API error");
            return Err(classify_response(provider, status, &body, retry_after));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        &self.record.id
    }

    async fn invoke(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<AdapterResponse> {
        let (body, notes) = self.build_body(request, ctx, false);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending completion request");

        let response = self.send(&body, false).await?;
        let api: MessagesResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocol {
                provider: self.record.id.clone(),
                message: format!("failed to parse response: {e}"),
            }
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &api.content {
            match block {
                ResponseBlock::Text { text: t } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: serde_json::to_string(input).unwrap_or_default(),
                    });
                }
            }
        }

        Ok(AdapterResponse {
            text,
            tool_calls,
            finish_reason: map_stop_reason(api.stop_reason.as_deref()),
            usage: Usage::new(api.usage.input_tokens, api.usage.output_tokens),
            model: api.model,
            notes,
        })
    }

    async fn stream(
        &self,
        request: &InferenceRequest,
        ctx: &AdapterContext,
    ) -> Result<mpsc::Receiver<Result<StreamFrame>>> {
        let (body, _notes) = self.build_body(request, ctx, true);
        debug!(provider = %self.record.id, model = %ctx.model, "Sending streaming request");

        let response = self.send(&body, true).await?;
        let provider = self.record.id.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
            let mut finish: Option<FinishReason> = None;

            // In-flight tool_use block accumulator
            let mut tool_id = String::new();
            let mut tool_name = String::new();
            let mut tool_args = String::new();
            let mut in_tool_use = false;

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
                            trace!(error = %e, "Ignoring unparseable Anthropic SSE line");
                            continue;
                        }
                    };

                    match event["type"].as_str().unwrap_or("") {
                        "message_start" => {
                            input_tokens = event["message"]["usage"]["input_tokens"]
                                .as_u64()
                                .unwrap_or(0) as u32;
                        }
                        "content_block_start" => {
                            let block = &event["content_block"];
                            if block["type"].as_str() == Some("tool_use") {
                                tool_id = block["id"].as_str().unwrap_or("").to_string();
                                tool_name = block["name"].as_str().unwrap_or("").to_string();
                                tool_args.clear();
                                in_tool_use = true;
                            }
                        }
                        "content_block_delta" => {
                            let delta = &event["delta"];
                            match delta["type"].as_str().unwrap_or("") {
                                "text_delta" => {
                                    if let Some(text) = delta["text"].as_str() {
                                        if tx.send(Ok(StreamFrame::delta(text))).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(partial) = delta["partial_json"].as_str() {
                                        tool_args.push_str(partial);
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            if in_tool_use {
                                let frame = StreamFrame {
                                    delta_tool_call: Some(ToolCall {
                                        id: std::mem::take(&mut tool_id),
                                        name: std::mem::take(&mut tool_name),
                                        arguments: std::mem::take(&mut tool_args),
                                    }),
                                    ..Default::default()
                                };
                                in_tool_use = false;
                                if tx.send(Ok(frame)).await.is_err() {
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

            // Upstream closed without message_stop
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
        // Minimal request; any parseable response (including 4xx about
        // the body) proves reachability and key validity enough.
        let body = serde_json::json!({
            "model": self.record.models.first().map(|m| m.id.as_str()).unwrap_or("claude-3-5-haiku-latest"),
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        let started = std::time::Instant::now();
        match self.send(&body, false).await {
            Ok(_) => Ok(HealthStatus {
                ok: true,
                latency_ms: started.elapsed().as_millis() as u64,
                rate_remaining: None,
            }),
            Err(e) => match e {
                GatewayError::ProviderUnavailable { .. } | GatewayError::ProviderTimeout { .. } => {
                    Ok(HealthStatus {
                        ok: false,
                        latency_ms: started.elapsed().as_millis() as u64,
                        rate_remaining: None,
                    })
                }
                other => Err(other),
            },
        }
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
        Some("refusal") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Stop,
    }
}

fn to_api_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                    "content": m.content,
                }]
            }),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let mut blocks: Vec<serde_json::Value> = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(serde_json::json!({ "type": "text", "text": m.content }));
                }
                for tc in &m.tool_calls {
                    let input: serde_json::Value =
                        serde_json::from_str(&tc.arguments).unwrap_or_default();
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": input,
                    }));
                }
                serde_json::json!({ "role": "assistant", "content": blocks })
            }
            Role::Assistant => serde_json::json!({ "role": "assistant", "content": m.content }),
            _ => serde_json::json!({ "role": "user", "content": m.content }),
        })
        .collect()
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ResponseBlock>,
    usage: MessagesUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmrouter_core::provider::{AuthScheme, Capability, Dialect, ModelRecord};
    use std::collections::BTreeSet;

    fn adapter() -> AnthropicAdapter {
        let record = Arc::new(ProviderRecord {
            id: "p_ant".into(),
            base_url: "https://api.anthropic.com".into(),
            dialect: Dialect::AnthropicMessages,
            auth: AuthScheme::HeaderKey {
                header: "x-api-key".into(),
            },
            capabilities: BTreeSet::from([Capability::Chat, Capability::FunctionCalling]),
            input_cost_per_m: 3.0,
            output_cost_per_m: 15.0,
            rate_budget_per_min: 300,
            models: vec![ModelRecord {
                id: "claude-sonnet-4".into(),
                context_window: 200_000,
                capabilities: BTreeSet::new(),
                quality: 0.95,
                loaded: true,
            }],
            region: None,
            compliance_tags: Vec::new(),
            version: 0,
        });
        AnthropicAdapter::new(record, Credentials::bearer("sk-ant-test")).unwrap()
    }

    #[test]
    fn system_hoisted_to_top_level() {
        let adapter = adapter();
        let request = InferenceRequest::from_messages(vec![
            ChatMessage::system("You are terse"),
            ChatMessage::user("Hi"),
        ]);
        let (body, notes) =
            adapter.build_body(&request, &AdapterContext::new("r", "claude-sonnet-4"), false);

        assert_eq!(body["system"], "You are terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(notes.is_empty());
    }

    #[test]
    fn alternation_repair_is_noted() {
        let adapter = adapter();
        let request = InferenceRequest::from_messages(vec![
            ChatMessage::user("one"),
            ChatMessage::user("two"),
        ]);
        let (body, notes) =
            adapter.build_body(&request, &AdapterContext::new("r", "claude-sonnet-4"), false);

        assert!(notes.contains(&"alternation_repaired".to_string()));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["content"], "one\n\ntwo");
    }

    #[test]
    fn tool_result_becomes_user_block() {
        let messages = vec![ChatMessage::tool_result("toolu_1", "42")];
        let api = to_api_messages(&messages);
        assert_eq!(api[0]["role"], "user");
        assert_eq!(api[0]["content"][0]["type"], "tool_result");
        assert_eq!(api[0]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn assistant_tool_calls_become_blocks() {
        let mut msg = ChatMessage::assistant("Let me check");
        msg.tool_calls = vec![ToolCall {
            id: "toolu_2".into(),
            name: "search".into(),
            arguments: r#"{"q":"rust"}"#.into(),
        }];
        let api = to_api_messages(&[msg]);
        let blocks = api[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["input"]["q"], "rust");
    }

    #[test]
    fn parse_tool_use_response() {
        let api: MessagesResponse = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4",
                "content": [
                    {"type": "text", "text": "Checking"},
                    {"type": "tool_use", "id": "toolu_a", "name": "calc", "input": {"expr": "2+2"}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        assert_eq!(api.content.len(), 2);
        assert_eq!(map_stop_reason(api.stop_reason.as_deref()), FinishReason::ToolCall);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCall);
        assert_eq!(map_stop_reason(Some("refusal")), FinishReason::ContentFilter);
    }

    #[test]
    fn temperature_clamped_to_anthropic_range() {
        let adapter = adapter();
        let mut request = InferenceRequest::from_prompt("Hi");
        request.temperature = 1.8;
        let (body, _) =
            adapter.build_body(&request, &AdapterContext::new("r", "claude-sonnet-4"), false);
        assert_eq!(body["temperature"], 1.0);
    }
}
