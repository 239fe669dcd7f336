//! Gateway assembly: pipeline construction, background tasks, and the
//! HTTP server entry point.
//!
//! Everything is built once at startup from the immutable `AppConfig`
//! and shared via `Arc` — no globals, no runtime re-wiring.

pub mod breaker;
pub mod cache;
pub mod http;
pub mod pipeline;
pub mod queue;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use llmrouter_adapters::{Credentials, build_adapter};
use llmrouter_auth::{ApiKeyStore, AuthService, Role, TokenService, UserStore};
use llmrouter_config::AppConfig;
use llmrouter_core::error::{GatewayError, Result};
use llmrouter_core::event::EventBus;
use llmrouter_core::registry::Registry;
use llmrouter_limits::{AdaptiveLimits, MemoryStore, RateLimiter, TierTable};
use llmrouter_router::Router;
use llmrouter_telemetry::{CostLedger, MetricsRegistry, ModelPricing, PricingTable};

use breaker::{BreakerConfig, CircuitBreakers};
use cache::ResponseCache;
use pipeline::{Pipeline, PipelineOptions};
use queue::DispatchQueue;

pub use http::{SharedState, build_router};
pub use pipeline::{Failure, Reply, RequestMeta};

/// Shared application state behind the HTTP surface.
pub struct GatewayState {
    pub pipeline: Arc<Pipeline>,
    pub auth: Arc<AuthService>,
    pub start_time: DateTime<Utc>,
}

/// Build the full gateway from configuration.
///
/// Adapters come from the provider blocks; the initial admin account is
/// created from `ADMIN_USERNAME`/`ADMIN_PASSWORD` (generated and logged
/// when absent, the way first-run pairing codes work).
pub fn build(config: &AppConfig) -> Result<SharedState> {
    let events = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsRegistry::new());

    // Registry + adapters + pricing from the provider blocks
    let registry = Arc::new(Registry::new());
    let pricing = Arc::new(PricingTable::empty());
    let mut adapters = Vec::new();
    for record in config.provider_records() {
        let provider_cfg = &config.providers[&record.id];
        let credentials = Credentials {
            api_key: provider_cfg.api_key.clone(),
            aws_access_key_id: provider_cfg.aws_access_key_id.clone(),
            aws_secret_access_key: provider_cfg.aws_secret_access_key.clone(),
            aws_region: provider_cfg.aws_region.clone(),
            credentials_file: provider_cfg.credentials_file.clone(),
        };
        for model in &record.models {
            pricing.set(
                format!("{}:{}", record.id, model.id),
                ModelPricing::new(record.input_cost_per_m, record.output_cost_per_m),
            );
        }
        let record = Arc::new(record);
        match build_adapter(record.clone(), credentials) {
            Ok(adapter) => adapters.push((record.id.clone(), adapter)),
            Err(e) => {
                warn!(provider = %record.id, error = %e, "Skipping provider; adapter construction failed");
                continue;
            }
        }
        registry.register((*record).clone())?;
    }

    let router = Arc::new(Router::new(
        registry.clone(),
        &config.routing.default_strategy,
        config.routing.balanced_weights,
    ));
    if !config.routing.fallback_chain.is_empty() {
        router.register_strategy(Arc::new(llmrouter_router::strategy::FallbackChain::new(
            config.routing.fallback_chain.clone(),
        )));
    }

    let tiers = TierTable::from_config(&config.rate_limit.tiers);
    let limiter = Arc::new(
        RateLimiter::new(
            MemoryStore::shared(),
            tiers.clone(),
            Duration::from_millis(config.rate_limit.window_ms),
            config.rate_limit.max_requests as i64,
        )
        .with_adaptive(AdaptiveLimits::new()),
    );

    let cache = Arc::new(ResponseCache::new(
        config.cache.enabled,
        Duration::from_secs(config.cache.ttl_seconds),
        config.cache.max_size,
    ));
    let breakers = Arc::new(CircuitBreakers::new(
        BreakerConfig {
            threshold: config.circuit_breaker.threshold,
            reset_timeout: Duration::from_millis(config.circuit_breaker.reset_ms),
            half_open_probes: config.circuit_breaker.half_open_probes,
        },
        events.clone(),
        metrics.clone(),
    ));
    let queue = Arc::new(DispatchQueue::new(
        config.runtime.max_concurrent_requests,
        config.runtime.queue_depth,
    ));

    let pipeline = Arc::new(Pipeline::new(
        registry,
        router,
        limiter,
        cache,
        breakers,
        queue,
        metrics,
        pricing,
        Arc::new(CostLedger::new()),
        events,
        tiers,
        PipelineOptions {
            provider_timeout: Duration::from_millis(config.runtime.provider_timeout_ms),
            request_timeout: Duration::from_millis(config.runtime.request_timeout_ms),
            max_retries: config.routing.max_retries,
            enable_fallback: config.routing.enable_fallback,
        },
    ));
    for (id, adapter) in adapters {
        pipeline.register_adapter(&id, adapter);
    }

    // Auth subsystem
    let jwt_secret = config.auth.jwt_secret.clone().ok_or_else(|| {
        GatewayError::Internal("JWT_SECRET must be configured before serving".into())
    })?;
    let users = UserStore::new(config.auth.bcrypt_rounds);
    let admin_username =
        std::env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".into());
    let admin_password = match std::env::var("ADMIN_PASSWORD") {
        Ok(p) => p,
        Err(_) => {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            info!(username = %admin_username, password = %generated, "Generated initial admin credentials");
            generated
        }
    };
    users.create(&admin_username, &admin_password, Role::Admin, "admin")?;
    let auth = Arc::new(AuthService::new(
        users,
        ApiKeyStore::new(config.auth.bcrypt_rounds),
        TokenService::new(
            &jwt_secret,
            config.auth.jwt_expires_in_secs,
            config.auth.refresh_expires_in_secs,
        ),
    ));

    Ok(Arc::new(GatewayState {
        pipeline,
        auth,
        start_time: Utc::now(),
    }))
}

/// Start the gateway HTTP server and its background tasks.
pub async fn start(config: AppConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let state = build(&config)?;
    spawn_janitor(state.clone());
    if config.runtime.health_check_interval_ms > 0 {
        spawn_health_loop(
            state.clone(),
            Duration::from_millis(config.runtime.health_check_interval_ms),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Sweep expired blacklist/refresh entries and stale rate counters.
fn spawn_janitor(state: SharedState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            state.auth.sweep_expired();
        }
    });
}

/// Background provider health probes. Results feed logs and metrics;
/// hard failures warm up the breaker's picture of the provider.
fn spawn_health_loop(state: SharedState, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let snapshot = state.pipeline.registry.snapshot();
            for provider in snapshot.providers() {
                let Some(adapter) = state.pipeline.adapter(&provider.id) else {
                    continue;
                };
                match adapter.health().await {
                    Ok(status) if status.ok => {
                        tracing::debug!(provider = %provider.id, latency_ms = status.latency_ms, "Health probe ok");
                    }
                    Ok(status) => {
                        warn!(provider = %provider.id, latency_ms = status.latency_ms, "Health probe degraded");
                    }
                    Err(e) => {
                        warn!(provider = %provider.id, error = %e, "Health probe failed");
                    }
                }
            }
        }
    });
}
