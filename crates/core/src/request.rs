//! The normalized inference request.
//!
//! This is the single internal shape all transports decode into and all
//! adapters encode from. Wire field names are camelCase to match the
//! public JSON surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::message::{ChatMessage, ResponseFormat, ToolChoice, ToolDefinition};

fn default_temperature() -> f32 {
    0.7
}

/// A normalized inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    /// Single-turn prompt. Exactly one of `prompt` / `messages` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Ordered conversation. Exactly one of `prompt` / `messages` is set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,

    /// Model hint. The router may override unless `pin` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// When true, the hinted model is mandatory.
    #[serde(default)]
    pub pin: bool,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature, 0..2.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling mass, 0..1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Top-k cutoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    /// Whether to stream the response.
    #[serde(default)]
    pub stream: bool,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    /// Opaque caller metadata, echoed back in the response.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Default for InferenceRequest {
    fn default() -> Self {
        Self {
            prompt: None,
            messages: Vec::new(),
            model: None,
            pin: false,
            max_tokens: None,
            temperature: default_temperature(),
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: Vec::new(),
            stream: false,
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
            metadata: BTreeMap::new(),
        }
    }
}

impl InferenceRequest {
    /// Convenience constructor for a single-prompt request.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// Convenience constructor for a chat request.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Validate field presence and ranges. Returns `invalid_request` on
    /// the first violation.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let invalid = |message: &str| GatewayError::InvalidRequest {
            message: message.into(),
            details: None,
        };

        match (&self.prompt, self.messages.is_empty()) {
            (None, true) => return Err(invalid("one of 'prompt' or 'messages' is required")),
            (Some(_), false) => {
                return Err(invalid("'prompt' and 'messages' are mutually exclusive"));
            }
            _ => {}
        }

        if let Some(p) = &self.prompt {
            if p.is_empty() {
                return Err(invalid("'prompt' must not be empty"));
            }
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid("'temperature' must be within 0..2"));
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(invalid("'topP' must be within 0..1"));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(invalid("'maxTokens' must be at least 1"));
        }
        if self.pin && self.model.is_none() {
            return Err(invalid("'pin' requires 'model'"));
        }

        Ok(())
    }

    /// The conversation to send upstream: either `messages`, or the
    /// prompt wrapped as a single user message.
    pub fn effective_messages(&self) -> Vec<ChatMessage> {
        if let Some(prompt) = &self.prompt {
            vec![ChatMessage::user(prompt.clone())]
        } else {
            self.messages.clone()
        }
    }

    /// Rough prompt token estimate (4 chars ≈ 1 token). Exactness is a
    /// non-goal; this feeds context-window filtering and cost estimates.
    pub fn estimated_prompt_tokens(&self) -> u32 {
        let chars: usize = match &self.prompt {
            Some(p) => p.len(),
            None => self.messages.iter().map(|m| m.content.len()).sum(),
        };
        (chars / 4).max(1) as u32
    }

    /// Total context required: prompt plus requested completion.
    pub fn required_context(&self) -> u32 {
        self.estimated_prompt_tokens() + self.max_tokens.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_or_messages_is_required() {
        let empty = InferenceRequest::default();
        assert!(empty.validate().is_err());

        let both = InferenceRequest {
            prompt: Some("hi".into()),
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        assert!(both.validate().is_err());

        assert!(InferenceRequest::from_prompt("hi").validate().is_ok());
    }

    #[test]
    fn sampling_ranges_enforced() {
        let mut req = InferenceRequest::from_prompt("hi");
        req.temperature = 2.5;
        assert!(req.validate().is_err());

        req.temperature = 1.0;
        req.top_p = Some(1.5);
        assert!(req.validate().is_err());

        req.top_p = Some(0.9);
        req.max_tokens = Some(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn pin_requires_model() {
        let mut req = InferenceRequest::from_prompt("hi");
        req.pin = true;
        assert!(req.validate().is_err());
        req.model = Some("gpt-4o".into());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn prompt_becomes_user_message() {
        let req = InferenceRequest::from_prompt("Hello");
        let msgs = req.effective_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Hello");
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        let req = InferenceRequest::from_prompt("12345678901234567890");
        assert_eq!(req.estimated_prompt_tokens(), 5);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let req: InferenceRequest = serde_json::from_str(
            r#"{"prompt":"Hi","maxTokens":5,"topP":0.9,"stopSequences":["\n"],"stream":false}"#,
        )
        .unwrap();
        assert_eq!(req.max_tokens, Some(5));
        assert_eq!(req.top_p, Some(0.9));
        assert_eq!(req.stop_sequences, vec!["\n".to_string()]);
    }
}
