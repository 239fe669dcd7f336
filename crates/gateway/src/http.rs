//! HTTP surface for the gateway.
//!
//! Endpoints:
//!
//! - `POST /v1/inference`        — normalized inference (JSON or SSE stream)
//! - `POST /v1/embeddings`       — embeddings
//! - `POST /auth/login`          — password login, token pair
//! - `POST /auth/refresh`        — refresh rotation
//! - `POST /auth/apikeys`        — issue an API key (plaintext shown once)
//! - `GET  /auth/apikeys`        — list key metadata (never the key)
//! - `DELETE /auth/apikeys/{id}` — deactivate a key
//! - `GET  /admin/stats`         — counters, circuits, queue depth
//! - `POST /admin/cache/clear`   — purge the response cache
//! - `GET  /services`            — registered providers
//! - `GET  /models`              — registered models
//! - `POST /models/load`         — load a local model
//! - `DELETE /models/{id}`       — unload a local model
//! - `GET  /health`              — liveness
//!
//! Built on Axum for high performance async HTTP.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use llmrouter_adapters::local::LocalGgufAdapter;
use llmrouter_auth::{AuthService, Principal, Role};
use llmrouter_core::error::{ErrorEnvelope, GatewayError};
use llmrouter_core::event::GatewayEvent;
use llmrouter_core::response::{FinishReason, StreamFrame};

use crate::GatewayState;
use crate::pipeline::{Failure, Reply, RequestMeta};

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health_handler))
        .route("/v1/inference", post(inference_handler))
        .route("/v1/embeddings", post(embeddings_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route(
            "/auth/apikeys",
            post(create_apikey_handler).get(list_apikeys_handler),
        )
        .route("/auth/apikeys/{id}", delete(revoke_apikey_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .route("/admin/cache/clear", post(cache_clear_handler))
        .route("/services", get(services_handler))
        .route("/models", get(models_handler))
        .route("/models/load", post(load_model_handler))
        .route("/models/{id}", delete(unload_model_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ── Shared helpers ──────────────────────────────────────────────────────

fn failure_response(failure: Box<Failure>) -> Response {
    let Failure {
        error,
        request_id,
        attempts,
        headers,
    } = *failure;

    let mut envelope = ErrorEnvelope::new(&error, &request_id);
    if !attempts.is_empty() {
        envelope = envelope.with_attempts(&attempts);
    }
    if matches!(error, GatewayError::Internal(_)) {
        error!(request_id = %request_id, error = %error, "Internal gateway error");
    }

    let status = StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(envelope)).into_response();
    apply_headers(response.headers_mut(), &headers);
    response
}

fn error_response(error: GatewayError, request_id: &str) -> Response {
    failure_response(Box::new(Failure {
        error,
        request_id: request_id.to_string(),
        attempts: Vec::new(),
        headers: Vec::new(),
    }))
}

fn apply_headers(target: &mut HeaderMap, headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            target.insert(name, value);
        }
    }
}

async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<Principal, Response> {
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    state
        .auth
        .authenticate(authorization, api_key)
        .await
        .map_err(|e| error_response(e, "unauthenticated"))
}

fn request_meta(principal: Principal, headers: &HeaderMap) -> RequestMeta {
    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    RequestMeta {
        principal,
        ip,
        user_agent,
    }
}

// ── Liveness ────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": (Utc::now() - state.start_time).num_seconds(),
    }))
}

// ── Inference ───────────────────────────────────────────────────────────

async fn inference_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(raw): Json<serde_json::Value>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "inference:invoke") {
        return error_response(e, "forbidden");
    }

    let meta = request_meta(principal, &headers);
    match state.pipeline.run_inference(raw, &meta).await {
        Ok(Reply::Json {
            body,
            headers: reply_headers,
            ..
        }) => {
            let mut response = (StatusCode::OK, Json(body)).into_response();
            apply_headers(response.headers_mut(), &reply_headers);
            response
        }
        Ok(Reply::Stream {
            frames,
            headers: reply_headers,
            ..
        }) => {
            let stream = ReceiverStream::new(frames).map(|item| {
                let frame = match item {
                    Ok(frame) => frame,
                    // Error items become the error-terminator frame
                    Err(_) => StreamFrame::terminal(FinishReason::Error, None),
                };
                let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".into());
                Ok::<_, Infallible>(SseEvent::default().data(data))
            });
            let mut response = Sse::new(stream).into_response();
            apply_headers(response.headers_mut(), &reply_headers);
            response
        }
        Err(failure) => failure_response(failure),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddingsBody {
    input: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn embeddings_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<EmbeddingsBody>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "embeddings:invoke") {
        return error_response(e, "forbidden");
    }

    let meta = request_meta(principal, &headers);
    match state
        .pipeline
        .run_embeddings(body.model, body.input, &meta)
        .await
    {
        Ok((response, reply_headers)) => {
            let mut http = (StatusCode::OK, Json(response)).into_response();
            apply_headers(http.headers_mut(), &reply_headers);
            http
        }
        Err(failure) => failure_response(failure),
    }
}

// ── Auth ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login_handler(
    State(state): State<SharedState>,
    Json(body): Json<LoginBody>,
) -> Response {
    match state.auth.login(&body.username, &body.password).await {
        Ok((pair, user)) => Json(serde_json::json!({
            "accessToken": pair.access_token,
            "refreshToken": pair.refresh_token,
            "tokenType": pair.token_type,
            "user": {
                "id": user.id,
                "username": user.username,
                "role": user.role.as_str(),
                "tier": user.tier,
            },
        }))
        .into_response(),
        Err(e) => error_response(e, "login"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    refresh_token: String,
}

async fn refresh_handler(
    State(state): State<SharedState>,
    Json(body): Json<RefreshBody>,
) -> Response {
    match state.auth.refresh(&body.refresh_token) {
        Ok((pair, user)) => Json(serde_json::json!({
            "accessToken": pair.access_token,
            "refreshToken": pair.refresh_token,
            "tokenType": pair.token_type,
            "user": { "id": user.id, "username": user.username, "role": user.role.as_str() },
        }))
        .into_response(),
        Err(e) => error_response(e, "refresh"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

async fn create_apikey_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "keys:issue") {
        return error_response(e, "forbidden");
    }

    let permissions: Option<BTreeSet<String>> =
        body.permissions.map(|p| p.into_iter().collect());
    match state
        .auth
        .issue_key(&principal, &body.name, permissions, body.expires_at)
    {
        Ok(issued) => {
            state.pipeline.events.publish(GatewayEvent::KeyIssued {
                key_id: issued.meta.id.clone(),
                owner: principal.subject.clone(),
                timestamp: Utc::now(),
            });
            info!(key_id = %issued.meta.id, "API key issued");
            // The only response that ever carries the plaintext key
            Json(serde_json::json!({
                "id": issued.meta.id,
                "key": issued.key,
                "name": issued.meta.name,
                "permissions": issued.meta.permissions,
                "expiresAt": issued.meta.expires_at,
            }))
            .into_response()
        }
        Err(e) => error_response(e, "apikeys"),
    }
}

async fn list_apikeys_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let keys = state.auth.keys.list();
    Json(serde_json::json!({ "keys": keys, "requestedBy": principal.subject })).into_response()
}

async fn revoke_apikey_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "keys:issue") {
        return error_response(e, "forbidden");
    }
    match state.auth.keys.revoke(&id) {
        Ok(()) => {
            state.pipeline.events.publish(GatewayEvent::KeyRevoked {
                key_id: id.clone(),
                timestamp: Utc::now(),
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e, "apikeys"),
    }
}

// ── Admin ───────────────────────────────────────────────────────────────

async fn admin_stats_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state
        .auth
        .require_role(&principal, &[Role::Admin, Role::Operator])
    {
        return error_response(e, "forbidden");
    }

    let metrics = state.pipeline.metrics.snapshot();
    let circuits: Vec<serde_json::Value> = state
        .pipeline
        .breakers
        .states()
        .into_iter()
        .map(|(provider, circuit, failures)| {
            serde_json::json!({
                "provider": provider,
                "state": circuit,
                "consecutiveFailures": failures,
            })
        })
        .collect();

    Json(serde_json::json!({
        "metrics": metrics,
        "circuits": circuits,
        "queueDepth": state.pipeline.queue.depth(),
        "cacheEntries": state.pipeline.cache.len(),
        "totalCost": state.pipeline.ledger.total_cost(),
        "uptimeSecs": (Utc::now() - state.start_time).num_seconds(),
    }))
    .into_response()
}

#[derive(Deserialize, Default)]
struct ClearQuery {
    #[serde(default)]
    pattern: Option<String>,
}

async fn cache_clear_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ClearQuery>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "cache:clear") {
        return error_response(e, "forbidden");
    }
    let purged = state.pipeline.cache.clear(query.pattern.as_deref());
    Json(serde_json::json!({ "purged": purged })).into_response()
}

// ── Registry surface ────────────────────────────────────────────────────

async fn services_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "models:read") {
        return error_response(e, "forbidden");
    }

    let snapshot = state.pipeline.registry.snapshot();
    let services: Vec<serde_json::Value> = snapshot
        .providers()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "dialect": p.dialect,
                "capabilities": p.capabilities,
                "models": p.models.len(),
                "region": p.region,
                "version": p.version,
                "circuit": state.pipeline.breakers.state(&p.id),
            })
        })
        .collect();
    Json(serde_json::json!({ "services": services })).into_response()
}

async fn models_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "models:read") {
        return error_response(e, "forbidden");
    }

    let snapshot = state.pipeline.registry.snapshot();
    let models: Vec<serde_json::Value> = snapshot
        .providers()
        .flat_map(|p| {
            p.models.iter().map(move |m| {
                serde_json::json!({
                    "provider": p.id,
                    "id": m.id,
                    "contextWindow": m.context_window,
                    "quality": m.quality,
                    "loaded": m.loaded,
                })
            })
        })
        .collect();
    Json(serde_json::json!({ "models": models })).into_response()
}

#[derive(Deserialize)]
struct LoadModelBody {
    provider: String,
    model: String,
}

async fn load_model_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<LoadModelBody>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "models:write") {
        return error_response(e, "forbidden");
    }

    // Ask the runner first, then flip the registry row
    if let Some(adapter) = state.pipeline.adapter(&body.provider) {
        if let Some(local) = adapter.as_any().downcast_ref::<LocalGgufAdapter>() {
            if let Err(e) = local.load_model(&body.model).await {
                return error_response(e, "models");
            }
        }
    }
    match state
        .pipeline
        .registry
        .set_model_loaded(&body.provider, &body.model, true)
    {
        Ok(()) => {
            state.pipeline.events.publish(GatewayEvent::ModelLoaded {
                provider: body.provider,
                model: body.model,
                timestamp: Utc::now(),
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e, "models"),
    }
}

#[derive(Deserialize)]
struct UnloadQuery {
    provider: String,
}

async fn unload_model_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<UnloadQuery>,
) -> Response {
    let principal = match authenticate(&state, &headers).await {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(e) = state.auth.require_permission(&principal, "models:write") {
        return error_response(e, "forbidden");
    }

    if let Some(adapter) = state.pipeline.adapter(&query.provider) {
        if let Some(local) = adapter.as_any().downcast_ref::<LocalGgufAdapter>() {
            if let Err(e) = local.unload_model(&id).await {
                return error_response(e, "models");
            }
        }
    }
    match state
        .pipeline
        .registry
        .set_model_loaded(&query.provider, &id, false)
    {
        Ok(()) => {
            state.pipeline.events.publish(GatewayEvent::ModelUnloaded {
                provider: query.provider,
                model: id,
                timestamp: Utc::now(),
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e, "models"),
    }
}
