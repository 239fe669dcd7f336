//! Error taxonomy for the gateway.
//!
//! Every failure observable by a caller or by the pipeline is one of the
//! kinds below. The kind decides the HTTP status, whether the pipeline may
//! advance to a fallback candidate, and whether a `Retry-After` is emitted.
//!
//! Uses `thiserror` for ergonomic error definitions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a given error kind behaves in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help; surface immediately.
    Permanent,
    /// May succeed elsewhere or later; candidates for fallback/retry.
    Transient,
    /// Caller-initiated end of the request; nothing to surface.
    Terminal,
    /// A bug or invariant violation inside the gateway.
    Fatal,
}

/// The gateway error type.
///
/// Variants map 1:1 onto the wire `error` kinds; `kind()` yields the
/// wire string, `class()` the retry behavior, `status()` the HTTP code.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("authentication required")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The *caller* hit a gateway rate limit. Never triggers fallback —
    /// the upstream was not at fault.
    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_ms: u64 },

    /// An *upstream provider* returned 429. Advances the fallback chain.
    #[error("provider '{provider}' rate limited")]
    ProviderRateLimited {
        provider: String,
        retry_after_ms: Option<u64>,
    },

    #[error("provider '{provider}' timed out after {elapsed_ms}ms")]
    ProviderTimeout { provider: String, elapsed_ms: u64 },

    #[error("provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("content filtered by provider '{provider}'")]
    ContentFiltered { provider: String },

    #[error("context length exceeded: {required} tokens > {limit} window")]
    ContextLengthExceeded {
        provider: String,
        limit: u32,
        required: u32,
    },

    #[error("tool validation failed: {0}")]
    ToolValidation(String),

    #[error("upstream protocol error from '{provider}': {message}")]
    UpstreamProtocol { provider: String, message: String },

    #[error("capacity exceeded, retry after {retry_after_ms}ms")]
    CapacityExceeded { retry_after_ms: u64 },

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias using the gateway error.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Wire identifier for this kind, as carried in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderRateLimited { .. } => "provider_rate_limited",
            Self::ProviderTimeout { .. } => "provider_timeout",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ContentFiltered { .. } => "content_filtered",
            Self::ContextLengthExceeded { .. } => "context_length_exceeded",
            Self::ToolValidation(_) => "tool_validation_error",
            Self::UpstreamProtocol { .. } => "upstream_protocol_error",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Retry class of this kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest { .. }
            | Self::Unauthenticated(_)
            | Self::Forbidden(_)
            | Self::NotFound(_)
            | Self::ContentFiltered { .. }
            | Self::ContextLengthExceeded { .. }
            | Self::ToolValidation(_) => ErrorClass::Permanent,
            Self::RateLimited { .. }
            | Self::ProviderRateLimited { .. }
            | Self::ProviderTimeout { .. }
            | Self::ProviderUnavailable { .. }
            | Self::UpstreamProtocol { .. }
            | Self::CapacityExceeded { .. } => ErrorClass::Transient,
            Self::Cancelled => ErrorClass::Terminal,
            Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// HTTP status code for the response envelope.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } | Self::ToolValidation(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::ContentFiltered { .. } | Self::ContextLengthExceeded { .. } => 422,
            Self::CapacityExceeded { .. } => 503,
            Self::Cancelled => 499,
            Self::ProviderRateLimited { .. }
            | Self::ProviderTimeout { .. }
            | Self::ProviderUnavailable { .. }
            | Self::UpstreamProtocol { .. } => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Whether the pipeline may drop this candidate and try the next one.
    ///
    /// Caller-scope throttles (`rate_limited`, `capacity_exceeded`) are
    /// transient but must NOT advance the chain: the upstream never saw
    /// the request.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimited { .. }
                | Self::ProviderTimeout { .. }
                | Self::ProviderUnavailable { .. }
                | Self::UpstreamProtocol { .. }
        )
    }

    /// Whether this failure counts against the provider's circuit breaker.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(
            self,
            Self::ProviderTimeout { .. }
                | Self::ProviderUnavailable { .. }
                | Self::UpstreamProtocol { .. }
        )
    }

    /// Suggested wait before retrying, if the kind carries one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms, .. }
            | Self::CapacityExceeded { retry_after_ms } => Some(*retry_after_ms),
            Self::ProviderRateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// The JSON error body returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Error kind, e.g. `"rate_limited"`.
    pub error: String,

    /// Human-readable description.
    pub message: String,

    /// The id assigned to the request, for log correlation.
    pub request_id: String,

    /// Milliseconds to wait before retrying, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Kind-specific extras, e.g. the attempted provider chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    /// Build an envelope from an error, attaching the request id.
    pub fn new(err: &GatewayError, request_id: impl Into<String>) -> Self {
        let details = match err {
            GatewayError::InvalidRequest { details, .. } => details.clone(),
            GatewayError::ContextLengthExceeded { limit, required, .. } => Some(
                serde_json::json!({ "contextWindow": limit, "requiredTokens": required }),
            ),
            _ => None,
        };
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
            request_id: request_id.into(),
            retry_after: err.retry_after_ms(),
            details,
        }
    }

    /// Attach the list of providers the pipeline attempted.
    pub fn with_attempts(mut self, attempts: &[String]) -> Self {
        let entry = serde_json::json!(attempts);
        match &mut self.details {
            Some(serde_json::Value::Object(map)) => {
                map.insert("attempts".into(), entry);
            }
            _ => {
                self.details = Some(serde_json::json!({ "attempts": entry }));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_classes() {
        let cases: Vec<(GatewayError, ErrorClass)> = vec![
            (
                GatewayError::InvalidRequest {
                    message: "bad".into(),
                    details: None,
                },
                ErrorClass::Permanent,
            ),
            (
                GatewayError::ProviderTimeout {
                    provider: "p".into(),
                    elapsed_ms: 30_000,
                },
                ErrorClass::Transient,
            ),
            (GatewayError::Cancelled, ErrorClass::Terminal),
            (GatewayError::Internal("bug".into()), ErrorClass::Fatal),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "kind {}", err.kind());
        }
    }

    #[test]
    fn caller_throttle_never_falls_back() {
        let err = GatewayError::RateLimited {
            reason: "tier minute budget".into(),
            retry_after_ms: 12_000,
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.triggers_fallback());
        assert_eq!(err.retry_after_ms(), Some(12_000));
    }

    #[test]
    fn upstream_429_falls_back_without_circuit_penalty() {
        let err = GatewayError::ProviderRateLimited {
            provider: "p_oai".into(),
            retry_after_ms: Some(5_000),
        };
        assert!(err.triggers_fallback());
        assert!(!err.counts_against_circuit());
    }

    #[test]
    fn envelope_carries_attempts() {
        let err = GatewayError::ProviderUnavailable {
            provider: "p_b".into(),
            message: "503".into(),
        };
        let env = ErrorEnvelope::new(&err, "req-1")
            .with_attempts(&["p_a".to_string(), "p_b".to_string()]);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"], "provider_unavailable");
        assert_eq!(json["details"]["attempts"][0], "p_a");
        assert_eq!(json["requestId"], "req-1");
    }

    #[test]
    fn context_length_envelope_has_hint() {
        let err = GatewayError::ContextLengthExceeded {
            provider: "p".into(),
            limit: 8192,
            required: 10_000,
        };
        let env = ErrorEnvelope::new(&err, "req-2");
        let details = env.details.unwrap();
        assert_eq!(details["contextWindow"], 8192);
        assert_eq!(details["requiredTokens"], 10_000);
    }
}
