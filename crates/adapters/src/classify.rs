//! Upstream error classification.
//!
//! Maps provider HTTP status codes, error bodies, and retry hints onto
//! the gateway error taxonomy. Every adapter funnels its non-200
//! responses through here so the pipeline sees one consistent set of
//! kinds.

use std::time::Duration;

use llmrouter_core::error::GatewayError;

/// Parse a Retry-After header value (delta-seconds form).
pub fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    header?.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Retry hints some providers put in the error body instead of headers.
fn body_retry_ms(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    if let Some(ms) = value["error"]["retry_after_ms"].as_u64() {
        return Some(ms);
    }
    if let Some(secs) = value["error"]["retry_after"].as_u64() {
        return Some(secs * 1_000);
    }
    value["retry_after"].as_u64().map(|s| s * 1_000)
}

/// Classify a non-success upstream response.
pub fn classify_response(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> GatewayError {
    let lower = body.to_ascii_lowercase();

    // Body signals take precedence over the blunt status code
    if lower.contains("content_filter")
        || lower.contains("content_policy")
        || lower.contains("responsibleaipolicyviolation")
    {
        return GatewayError::ContentFiltered {
            provider: provider.to_string(),
        };
    }
    if lower.contains("context_length") || lower.contains("maximum context") {
        return GatewayError::ContextLengthExceeded {
            provider: provider.to_string(),
            limit: 0,
            required: 0,
        };
    }

    match status {
        429 => GatewayError::ProviderRateLimited {
            provider: provider.to_string(),
            retry_after_ms: retry_after
                .map(|d| d.as_millis() as u64)
                .or_else(|| body_retry_ms(body)),
        },
        408 | 504 => GatewayError::ProviderTimeout {
            provider: provider.to_string(),
            elapsed_ms: 0,
        },
        401 | 403 => GatewayError::Internal(format!(
            "provider '{provider}' rejected configured credentials (status {status})"
        )),
        404 => GatewayError::NotFound(format!("provider '{provider}' model")),
        413 => GatewayError::ContextLengthExceeded {
            provider: provider.to_string(),
            limit: 0,
            required: 0,
        },
        400 | 422 => GatewayError::InvalidRequest {
            message: format!("provider '{provider}' rejected the request: {}", truncate(body)),
            details: None,
        },
        500..=599 => GatewayError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("status {status}: {}", truncate(body)),
        },
        _ => GatewayError::UpstreamProtocol {
            provider: provider.to_string(),
            message: format!("unexpected status {status}"),
        },
    }
}

/// Wrap a transport-level reqwest failure.
pub fn classify_transport(provider: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::ProviderTimeout {
            provider: provider.to_string(),
            elapsed_ms: 0,
        }
    } else if err.is_connect() {
        GatewayError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("connect: {err}"),
        }
    } else if err.is_decode() {
        GatewayError::UpstreamProtocol {
            provider: provider.to_string(),
            message: format!("decode: {err}"),
        }
    } else {
        GatewayError::ProviderUnavailable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_prefers_header_then_body() {
        let err = classify_response("p", 429, "{}", Some(Duration::from_secs(7)));
        match err {
            GatewayError::ProviderRateLimited { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, Some(7_000));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let err = classify_response("p", 429, r#"{"error":{"retry_after":3}}"#, None);
        assert_eq!(err.retry_after_ms(), Some(3_000));
    }

    #[test]
    fn content_filter_overrides_status() {
        let err = classify_response(
            "p",
            400,
            r#"{"error":{"code":"content_filter","message":"blocked"}}"#,
            None,
        );
        assert_eq!(err.kind(), "content_filtered");
    }

    #[test]
    fn context_length_from_body() {
        let err = classify_response(
            "p",
            400,
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#,
            None,
        );
        assert_eq!(err.kind(), "context_length_exceeded");
    }

    #[test]
    fn status_taxonomy() {
        assert_eq!(classify_response("p", 503, "", None).kind(), "provider_unavailable");
        assert_eq!(classify_response("p", 504, "", None).kind(), "provider_timeout");
        assert_eq!(classify_response("p", 400, "bad", None).kind(), "invalid_request");
        assert_eq!(classify_response("p", 404, "", None).kind(), "not_found");
        assert_eq!(classify_response("p", 302, "", None).kind(), "upstream_protocol_error");
        // Misconfigured gateway credentials are not the caller's fault
        assert_eq!(classify_response("p", 401, "", None).kind(), "internal");
    }

    #[test]
    fn fallback_classes_line_up() {
        assert!(classify_response("p", 503, "", None).triggers_fallback());
        assert!(classify_response("p", 429, "{}", None).triggers_fallback());
        assert!(!classify_response("p", 400, "bad", None).triggers_fallback());
    }

    #[test]
    fn retry_after_header_parsing() {
        assert_eq!(parse_retry_after(Some("15")), Some(Duration::from_secs(15)));
        assert_eq!(parse_retry_after(Some(" 2 ")), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
