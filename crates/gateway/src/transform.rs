//! Built-in request/response transformers.
//!
//! Applied at the pipeline edges: legacy request keys are mapped onto
//! the current wire names before validation, and bare-string upstream
//! bodies are wrapped into the standard response envelope.

/// Map legacy request keys onto their current names. Unknown keys pass
/// through untouched; existing current-name keys are never overwritten.
pub fn standardize_inference_request(mut body: serde_json::Value) -> serde_json::Value {
    let Some(map) = body.as_object_mut() else {
        return body;
    };

    const RENAMES: [(&str, &str); 3] = [
        ("input", "prompt"),
        ("max_tokens", "maxTokens"),
        ("top_p", "topP"),
    ];
    for (legacy, current) in RENAMES {
        if map.contains_key(legacy) && !map.contains_key(current) {
            if let Some(value) = map.remove(legacy) {
                map.insert(current.to_string(), value);
            }
        } else {
            map.remove(legacy);
        }
    }
    body
}

/// Wrap bare string bodies as a standard response object.
pub fn standardize_inference_response(body: serde_json::Value) -> serde_json::Value {
    match body {
        serde_json::Value::String(text) => serde_json::json!({
            "text": text,
            "model": "",
            "usage": { "promptTokens": 0, "completionTokens": 0, "totalTokens": 0 },
        }),
        other => other,
    }
}
