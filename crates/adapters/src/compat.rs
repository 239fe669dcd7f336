//! Dialect compatibility fix-ups.
//!
//! Providers disagree on message shape: some hoist the system prompt to
//! a top-level field, some require strict user/assistant alternation,
//! some have no native tool calling at all. The helpers here repair the
//! normalized conversation for a given dialect and note every fix-up so
//! it can be surfaced in response metadata.

use llmrouter_core::message::{ChatMessage, Role, ToolCall, ToolChoice, ToolDefinition};

/// Separator used when merging consecutive same-role messages.
const MERGE_SEPARATOR: &str = "\n\n";

/// Neutral filler injected when alternation cannot otherwise be
/// satisfied.
const NEUTRAL_USER: &str = "(continue)";

/// Pull system messages out of the conversation for dialects that carry
/// the system prompt as a top-level field.
pub fn extract_system(messages: &[ChatMessage]) -> (Option<String>, Vec<ChatMessage>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut rest = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(&msg.content),
            _ => rest.push(msg.clone()),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join(MERGE_SEPARATOR))
    };
    (system, rest)
}

/// Enforce strict user/assistant alternation starting with a user turn.
///
/// Consecutive same-role messages are merged with a separator; a neutral
/// user message is injected when the sequence would otherwise start with
/// the assistant. Returns the repaired sequence and whether anything was
/// changed, so the adapter can note the fix-up in metadata.
pub fn enforce_alternation(messages: &[ChatMessage]) -> (Vec<ChatMessage>, bool) {
    let mut fixed = false;
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for msg in messages {
        // Tool results keep their position; alternation rules apply to
        // the user/assistant turns around them.
        if msg.role == Role::Tool {
            out.push(msg.clone());
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev.role == msg.role => {
                prev.content.push_str(MERGE_SEPARATOR);
                prev.content.push_str(&msg.content);
                prev.tool_calls.extend(msg.tool_calls.iter().cloned());
                fixed = true;
            }
            _ => out.push(msg.clone()),
        }
    }

    if out.first().is_some_and(|m| m.role == Role::Assistant) {
        out.insert(0, ChatMessage::user(NEUTRAL_USER));
        fixed = true;
    }

    (out, fixed)
}

/// System fragment prepended when the caller asked for JSON output and
/// the dialect has no native JSON mode.
pub fn json_mode_preamble() -> &'static str {
    "Respond with valid JSON only. Do not wrap the JSON in markdown fences or add commentary."
}

/// Build a synthesized tool-calling instruction for dialects without
/// native function calling. The model is told to answer with a single
/// JSON object naming the tool and its arguments.
pub fn synthesize_tool_prompt(tools: &[ToolDefinition], choice: Option<&ToolChoice>) -> String {
    let mut prompt = String::from(
        "You can call tools. To call one, respond with ONLY a JSON object of the form \
         {\"tool\": \"<name>\", \"arguments\": {…}} and nothing else.\n\nAvailable tools:\n",
    );
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters (JSON Schema): {}\n",
            tool.name,
            tool.description,
            serde_json::to_string(&tool.parameters).unwrap_or_else(|_| "{}".into())
        ));
    }
    if let Some(ToolChoice::Named(name)) = choice {
        prompt.push_str(&format!("\nYou MUST call the tool \"{name}\".\n"));
    }
    prompt
}

/// Find the first balanced JSON object embedded in free text.
pub fn extract_json_block(text: &str) -> Option<serde_json::Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a synthesized tool call out of a model reply.
pub fn parse_tool_call_from_text(text: &str) -> Option<ToolCall> {
    let value = extract_json_block(text)?;
    let name = value.get("tool")?.as_str()?.to_string();
    let arguments = value.get("arguments").cloned().unwrap_or(serde_json::json!({}));
    Some(ToolCall {
        id: format!("synth_{}", uuid::Uuid::new_v4().simple()),
        name,
        arguments: arguments.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_extraction_joins_parts() {
        let messages = vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::system("Be concise"),
            ChatMessage::user("Hello"),
        ];
        let (system, rest) = extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn alternation_merges_consecutive_roles() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply"),
        ];
        let (fixed, changed) = enforce_alternation(&messages);
        assert!(changed);
        assert_eq!(fixed.len(), 2);
        assert_eq!(fixed[0].content, "first\n\nsecond");
    }

    #[test]
    fn alternation_injects_leading_user_turn() {
        let messages = vec![ChatMessage::assistant("hello there")];
        let (fixed, changed) = enforce_alternation(&messages);
        assert!(changed);
        assert_eq!(fixed[0].role, Role::User);
        assert_eq!(fixed[1].role, Role::Assistant);
    }

    #[test]
    fn wellformed_conversation_is_untouched() {
        let messages = vec![ChatMessage::user("q"), ChatMessage::assistant("a")];
        let (fixed, changed) = enforce_alternation(&messages);
        assert!(!changed);
        assert_eq!(fixed.len(), 2);
    }

    #[test]
    fn json_block_extraction_handles_prose_and_strings() {
        let text = r#"Sure, here you go: {"tool": "search", "arguments": {"q": "braces { in } strings"}} hope that helps"#;
        let value = extract_json_block(text).unwrap();
        assert_eq!(value["tool"], "search");
        assert_eq!(value["arguments"]["q"], "braces { in } strings");

        assert!(extract_json_block("no json here").is_none());
        assert!(extract_json_block("{ truncated").is_none());
    }

    #[test]
    fn synthesized_tool_round_trip() {
        let tools = vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let prompt = synthesize_tool_prompt(&tools, Some(&ToolChoice::Named("get_weather".into())));
        assert!(prompt.contains("get_weather"));
        assert!(prompt.contains("MUST call"));

        let reply = r#"{"tool": "get_weather", "arguments": {"city": "Oslo"}}"#;
        let call = parse_tool_call_from_text(reply).unwrap();
        assert_eq!(call.name, "get_weather");
        let args: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(args["city"], "Oslo");
    }
}
