//! Normalized responses, stream frames, and usage accounting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::ToolCall;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCall,
    ContentFilter,
    Error,
}

/// Token usage for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A tool call surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallOut {
    pub name: String,
    /// Arguments as parsed JSON.
    pub arguments: serde_json::Value,
}

impl From<&ToolCall> for ToolCallOut {
    fn from(tc: &ToolCall) -> Self {
        Self {
            name: tc.name.clone(),
            arguments: serde_json::from_str(&tc.arguments)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A complete (non-streaming) normalized response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    /// The generated text.
    pub text: String,

    /// `"<providerId>:<modelId>"`.
    pub model: String,

    /// The provider that served the request.
    pub provider: String,

    pub usage: Usage,

    /// Estimated cost in USD.
    pub cost: f64,

    pub finish_reason: FinishReason,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallOut>,

    /// Request id, processing time, caller metadata echo, adapter notes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// One frame of a streamed response.
///
/// A stream is a finite, non-restartable sequence of frames; exactly one
/// frame (the last) carries `finish_reason`, and usage totals ride on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    /// Partial text delta.
    #[serde(default)]
    pub delta: String,

    /// Partial tool-call delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_tool_call: Option<ToolCall>,

    /// Set only on the terminal frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    /// Totals, carried on the terminal frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamFrame {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            ..Default::default()
        }
    }

    pub fn terminal(finish_reason: FinishReason, usage: Option<Usage>) -> Self {
        Self {
            finish_reason: Some(finish_reason),
            usage,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Embedding vectors for a batch of inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingResponse {
    /// One vector per input text, in input order.
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
}

/// A reranked document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredDocument {
    /// Index into the caller's document list.
    pub index: usize,
    /// Relevance score, higher is better.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_totals() {
        let u = Usage::new(10, 5);
        assert_eq!(u.total_tokens, 15);
    }

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&FinishReason::ContentFilter).unwrap(),
            "\"content_filter\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCall).unwrap(),
            "\"tool_call\""
        );
    }

    #[test]
    fn terminal_frame_carries_reason_and_usage() {
        let f = StreamFrame::terminal(FinishReason::Stop, Some(Usage::new(3, 4)));
        assert!(f.is_terminal());
        assert_eq!(f.usage.unwrap().total_tokens, 7);
        assert!(!StreamFrame::delta("He").is_terminal());
    }

    #[test]
    fn tool_call_out_parses_arguments() {
        let tc = ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: r#"{"city":"Oslo"}"#.into(),
        };
        let out = ToolCallOut::from(&tc);
        assert_eq!(out.arguments["city"], "Oslo");
    }
}
