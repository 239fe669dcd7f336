//! Configuration loading, validation, and management for the gateway.
//!
//! Loads configuration from a TOML file, applies environment variable
//! overrides last, and validates all settings at startup. The resulting
//! `AppConfig` is immutable and threaded through construction; nothing
//! reads the process environment after load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use llmrouter_core::provider::{AuthScheme, Capability, Dialect, ModelRecord, ProviderRecord};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub server: ServerConfig,

    /// Log filter, e.g. "info" or "llmrouter_gateway=debug,info".
    #[serde(rename = "log_level")]
    pub log_level: LogLevelConfig,

    pub runtime: RuntimeConfig,

    pub cache: CacheConfig,

    pub rate_limit: RateLimitConfig,

    pub auth: AuthConfig,

    pub routing: RoutingConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    /// Registered upstream providers, keyed by provider id.
    pub providers: BTreeMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevelConfig(pub String);

impl Default for LogLevelConfig {
    fn default() -> Self {
        Self("info".into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Global concurrent request cap.
    pub max_concurrent_requests: usize,

    /// Length of the backpressure wait queue beyond the cap.
    pub queue_depth: usize,

    /// Per-request total deadline.
    pub request_timeout_ms: u64,

    /// Per-adapter dispatch timeout.
    pub provider_timeout_ms: u64,

    /// Background provider health probe cadence. 0 disables.
    pub health_check_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 256,
            queue_depth: 100,
            request_timeout_ms: 60_000,
            provider_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            max_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Window for the global fixed-window bucket.
    pub window_ms: u64,

    /// Request cap inside the global window.
    pub max_requests: u64,

    /// Tier overrides; unnamed tiers keep built-in defaults.
    pub tiers: BTreeMap<String, TierConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 10_000,
            tiers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TierConfig {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub concurrent: u64,
    pub daily_tokens: u64,
    pub monthly_requests: u64,
    pub cost_multiplier: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1_000,
            concurrent: 5,
            daily_tokens: 100_000,
            monthly_requests: 10_000,
            cost_multiplier: 1.0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
    /// HS256 signing secret. Must be set outside of tests.
    pub jwt_secret: Option<String>,

    /// Access token TTL in seconds.
    pub jwt_expires_in_secs: u64,

    /// Refresh token TTL in seconds.
    pub refresh_expires_in_secs: u64,

    pub bcrypt_rounds: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expires_in_secs: 3_600,
            refresh_expires_in_secs: 7 * 24 * 3_600,
            bcrypt_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
    /// One of the built-in strategy names.
    pub default_strategy: String,

    pub enable_fallback: bool,

    /// Fallback attempts after the first candidate.
    pub max_retries: u32,

    /// Weights for the `balanced` strategy, in factor order
    /// quality/cost/speed/availability/reliability.
    pub balanced_weights: [f64; 5],

    /// Fixed priority list for the `fallback-chain` strategy.
    pub fallback_chain: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: "balanced".into(),
            enable_fallback: true,
            max_retries: 2,
            balanced_weights: [0.3, 0.2, 0.2, 0.15, 0.15],
            fallback_chain: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,

    /// How long an open breaker refuses dispatch.
    pub reset_ms: u64,

    /// Probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_ms: 30_000,
            half_open_probes: 1,
        }
    }
}

/// One upstream provider entry.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Wire dialect, e.g. "openai_chat", "anthropic_messages".
    pub dialect: Dialect,

    /// Endpoint base URL; a dialect-specific default applies when unset.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer/header credential, when the scheme needs one.
    #[serde(default)]
    pub api_key: Option<String>,

    /// SigV4 credentials (Bedrock).
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub aws_region: Option<String>,

    /// Path to a service-account JSON (Vertex).
    #[serde(default)]
    pub credentials_file: Option<String>,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(default)]
    pub input_cost_per_m: f64,
    #[serde(default)]
    pub output_cost_per_m: f64,

    #[serde(default = "default_rate_budget")]
    pub rate_budget_per_min: u32,

    #[serde(default)]
    pub models: Vec<ModelConfig>,

    #[serde(default)]
    pub region: Option<String>,
}

fn default_rate_budget() -> u32 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

fn default_context_window() -> u32 {
    8_192
}

fn default_quality() -> f64 {
    0.5
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("jwt_expires_in_secs", &self.jwt_expires_in_secs)
            .field("refresh_expires_in_secs", &self.refresh_expires_in_secs)
            .field("bcrypt_rounds", &self.bcrypt_rounds)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("dialect", &self.dialect)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("aws_access_key_id", &redact(&self.aws_access_key_id))
            .field("aws_secret_access_key", &redact(&self.aws_secret_access_key))
            .field("aws_region", &self.aws_region)
            .field("credentials_file", &self.credentials_file)
            .field("models", &self.models)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("server", &self.server)
            .field("log_level", &self.log_level)
            .field("runtime", &self.runtime)
            .field("cache", &self.cache)
            .field("rate_limit", &self.rate_limit)
            .field("auth", &self.auth)
            .field("routing", &self.routing)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("providers", &self.providers)
            .finish()
    }
}

const BUILTIN_STRATEGIES: &[&str] = &[
    "quality-first",
    "cost-optimized",
    "speed-priority",
    "balanced",
    "load-balanced",
    "fallback-chain",
];

impl AppConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&text)?;
        config.overlay_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is given.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();
        config.overlay_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variables on top of the loaded file. The overlay
    /// always wins. Unparseable values are ignored with a warning rather
    /// than silently replacing a valid file setting with garbage.
    pub fn overlay_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "HOST" => self.server.host = value,
                "PORT" => set_parsed(&mut self.server.port, &key, &value),
                "LOG_LEVEL" => self.log_level = LogLevelConfig(value),
                "MAX_CONCURRENT_REQUESTS" => {
                    set_parsed(&mut self.runtime.max_concurrent_requests, &key, &value)
                }
                "REQUEST_TIMEOUT_MS" => {
                    set_parsed(&mut self.runtime.request_timeout_ms, &key, &value)
                }
                "HEALTH_CHECK_INTERVAL_MS" => {
                    set_parsed(&mut self.runtime.health_check_interval_ms, &key, &value)
                }
                "CACHE_ENABLED" => set_parsed(&mut self.cache.enabled, &key, &value),
                "CACHE_TTL_SECONDS" => set_parsed(&mut self.cache.ttl_seconds, &key, &value),
                "CACHE_MAX_SIZE" => set_parsed(&mut self.cache.max_size, &key, &value),
                "RATE_LIMIT_WINDOW_MS" => {
                    set_parsed(&mut self.rate_limit.window_ms, &key, &value)
                }
                "RATE_LIMIT_MAX_REQUESTS" => {
                    set_parsed(&mut self.rate_limit.max_requests, &key, &value)
                }
                "JWT_SECRET" => self.auth.jwt_secret = Some(value),
                "JWT_EXPIRES_IN" => {
                    set_parsed(&mut self.auth.jwt_expires_in_secs, &key, &value)
                }
                "BCRYPT_ROUNDS" => set_parsed(&mut self.auth.bcrypt_rounds, &key, &value),
                "DEFAULT_ROUTING_STRATEGY" => self.routing.default_strategy = value,
                "ENABLE_FALLBACK" => set_parsed(&mut self.routing.enable_fallback, &key, &value),
                "CIRCUIT_BREAKER_THRESHOLD" => {
                    set_parsed(&mut self.circuit_breaker.threshold, &key, &value)
                }
                "CIRCUIT_BREAKER_RESET_MS" => {
                    set_parsed(&mut self.circuit_breaker.reset_ms, &key, &value)
                }
                "OPENAI_API_KEY" => self.set_dialect_key(Dialect::OpenaiChat, value),
                "ANTHROPIC_API_KEY" => self.set_dialect_key(Dialect::AnthropicMessages, value),
                "COHERE_API_KEY" => self.set_dialect_key(Dialect::CohereChat, value),
                "AZURE_OPENAI_API_KEY" => self.set_dialect_key(Dialect::AzureOpenai, value),
                "AZURE_OPENAI_ENDPOINT" => {
                    for p in self.providers.values_mut() {
                        if p.dialect == Dialect::AzureOpenai {
                            p.base_url = Some(value.clone());
                        }
                    }
                }
                "AWS_ACCESS_KEY_ID" => {
                    for p in self.providers.values_mut() {
                        if p.dialect == Dialect::BedrockInvoke {
                            p.aws_access_key_id = Some(value.clone());
                        }
                    }
                }
                "AWS_SECRET_ACCESS_KEY" => {
                    for p in self.providers.values_mut() {
                        if p.dialect == Dialect::BedrockInvoke {
                            p.aws_secret_access_key = Some(value.clone());
                        }
                    }
                }
                "AWS_REGION" => {
                    for p in self.providers.values_mut() {
                        if p.dialect == Dialect::BedrockInvoke {
                            p.aws_region = Some(value.clone());
                        }
                    }
                }
                "GOOGLE_APPLICATION_CREDENTIALS" => {
                    for p in self.providers.values_mut() {
                        if p.dialect == Dialect::VertexPredict {
                            p.credentials_file = Some(value.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn set_dialect_key(&mut self, dialect: Dialect, value: String) {
        for p in self.providers.values_mut() {
            if p.dialect == dialect {
                p.api_key = Some(value.clone());
            }
        }
    }

    /// Validate ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !BUILTIN_STRATEGIES.contains(&self.routing.default_strategy.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown routing strategy '{}'",
                self.routing.default_strategy
            )));
        }

        let weight_sum: f64 = self.routing.balanced_weights.iter().sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(ConfigError::Invalid(format!(
                "balanced_weights must sum to 1.0, got {weight_sum:.3}"
            )));
        }

        if self.auth.bcrypt_rounds < 4 || self.auth.bcrypt_rounds > 16 {
            return Err(ConfigError::Invalid(
                "bcrypt_rounds must be within 4..=16".into(),
            ));
        }

        if self.runtime.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }

        if self.circuit_breaker.threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.threshold must be at least 1".into(),
            ));
        }

        for (id, provider) in &self.providers {
            for model in &provider.models {
                if !(0.0..=1.0).contains(&model.quality) {
                    return Err(ConfigError::Invalid(format!(
                        "provider '{id}' model '{}': quality must be within 0..1",
                        model.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Materialize provider records for the registry.
    pub fn provider_records(&self) -> Vec<ProviderRecord> {
        self.providers
            .iter()
            .map(|(id, p)| ProviderRecord {
                id: id.clone(),
                base_url: p
                    .base_url
                    .clone()
                    .unwrap_or_else(|| default_base_url(p.dialect)),
                dialect: p.dialect,
                auth: auth_scheme_for(p),
                capabilities: p.capabilities.iter().copied().collect(),
                input_cost_per_m: p.input_cost_per_m,
                output_cost_per_m: p.output_cost_per_m,
                rate_budget_per_min: p.rate_budget_per_min,
                models: p
                    .models
                    .iter()
                    .map(|m| ModelRecord {
                        id: m.id.clone(),
                        context_window: m.context_window,
                        capabilities: m.capabilities.iter().copied().collect(),
                        quality: m.quality,
                        loaded: true,
                    })
                    .collect(),
                region: p.region.clone(),
                compliance_tags: Vec::new(),
                version: 0,
            })
            .collect()
    }
}

/// Auth scheme implied by a provider's dialect and credentials.
fn auth_scheme_for(p: &ProviderConfig) -> AuthScheme {
    match p.dialect {
        Dialect::AnthropicMessages => AuthScheme::HeaderKey {
            header: "x-api-key".into(),
        },
        Dialect::AzureOpenai => AuthScheme::HeaderKey {
            header: "api-key".into(),
        },
        Dialect::BedrockInvoke => AuthScheme::SigV4 {
            region: p.aws_region.clone().unwrap_or_else(|| "us-east-1".into()),
            service: "bedrock".into(),
        },
        Dialect::VertexPredict => AuthScheme::ServiceAccountJwt {
            token_uri: "https://oauth2.googleapis.com/token".into(),
            scope: "https://www.googleapis.com/auth/cloud-platform".into(),
        },
        Dialect::GgufLocal => AuthScheme::None,
        _ => AuthScheme::Bearer,
    }
}

/// Default endpoint for well-known dialects.
pub fn default_base_url(dialect: Dialect) -> String {
    match dialect {
        Dialect::OpenaiChat => "https://api.openai.com/v1".into(),
        Dialect::AnthropicMessages => "https://api.anthropic.com".into(),
        Dialect::Mistral => "https://api.mistral.ai/v1".into(),
        Dialect::Together => "https://api.together.xyz/v1".into(),
        Dialect::Fireworks => "https://api.fireworks.ai/inference/v1".into(),
        Dialect::Groq => "https://api.groq.com/openai/v1".into(),
        Dialect::Openrouter => "https://openrouter.ai/api/v1".into(),
        Dialect::Huggingface => "https://api-inference.huggingface.co".into(),
        Dialect::CohereChat | Dialect::CohereEmbed | Dialect::CohereRerank => {
            "https://api.cohere.com".into()
        }
        Dialect::GgufLocal => "http://localhost:8080".into(),
        Dialect::AzureOpenai | Dialect::BedrockInvoke | Dialect::VertexPredict => String::new(),
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparseable environment override");
        }
    }
}
