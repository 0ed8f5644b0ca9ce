//! HTTP API for chat and indexer administration.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/chat` | Run one chat turn |
//! | `GET`  | `/api/me` | Delegated user profile |
//! | `POST` | `/api/admin/knowledge-indexer/run` | Trigger an indexing pass |
//! | `POST` | `/api/admin/knowledge-indexer/test` | Trigger a pass without embeddings |
//! | `GET`  | `/api/admin/knowledge-indexer/preview` | List discovery candidates |
//! | `GET`  | `/api/admin/knowledge-indexer/stats` | Vector index statistics |
//! | `GET`  | `/health` | Liveness check (no authentication) |
//!
//! # Authentication
//!
//! Every `/api` endpoint requires `Authorization: Bearer <token>`. Token
//! *validation* belongs to the fronting middleware; this layer trusts the
//! token, decodes its claims without signature verification to identify
//! the caller, and keeps the raw token as the user's delegated
//! credential for downstream permission probes.
//!
//! # Error Contract
//!
//! ```json
//! { "statusCode": 400, "message": "messages must not be empty", "error": "bad_request" }
//! ```
//!
//! Error responses never carry stack traces or upstream tokens.

use axum::{
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::agent::ChatCore;
use crate::graph::{DocumentProvider, ProviderError};
use crate::indexer::{IndexerScheduler, PassOptions, RunOutcome, DEFAULT_DAYS_BACK};
use crate::models::{AuthenticatedUser, ChatContext, ChatMessage};
use crate::vector_store::VectorIndex;

/// Candidates listed by the preview endpoint when no limit is given.
const DEFAULT_PREVIEW_LIMIT: usize = 50;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatCore>,
    pub scheduler: Arc<IndexerScheduler>,
    pub index: Arc<dyn VectorIndex>,
    pub provider: Arc<dyn DocumentProvider>,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/me", get(handle_me))
        .route("/api/admin/knowledge-indexer/run", post(handle_run))
        .route("/api/admin/knowledge-indexer/test", post(handle_test))
        .route("/api/admin/knowledge-indexer/preview", get(handle_preview))
        .route("/api/admin/knowledge-indexer/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn run_server(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============ Error response ============

/// API error that renders as the stable JSON error contract.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }

    fn body(&self) -> Value {
        json!({
            "statusCode": self.status.as_u16(),
            "message": self.message,
            "error": self.code,
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

/// Map a provider failure onto the HTTP contract without leaking detail.
fn provider_error(e: ProviderError) -> ApiError {
    match e {
        ProviderError::Unauthorized(_) => ApiError::forbidden("access denied by the provider"),
        ProviderError::Auth(_) => ApiError::internal("provider authentication failed"),
        _ => ApiError::internal("provider request failed"),
    }
}

// ============ Authentication extractor ============

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

        decode_bearer_identity(token)
            .ok_or_else(|| ApiError::unauthorized("invalid bearer token"))
    }
}

/// Decode the caller's identity from a bearer token's claims.
///
/// The fronting middleware has already validated the token; this only
/// reads the payload segment (no signature check) to learn who the
/// caller is, and keeps the raw token as their delegated credential.
fn decode_bearer_identity(token: &str) -> Option<AuthenticatedUser> {
    let payload = token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;

    let id = claims["oid"]
        .as_str()
        .or_else(|| claims["sub"].as_str())?
        .to_string();
    let email = claims["preferred_username"]
        .as_str()
        .or_else(|| claims["email"].as_str())
        .or_else(|| claims["upn"].as_str())
        .unwrap_or_default()
        .to_string();
    let name = claims["name"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| email.clone());

    Some(AuthenticatedUser {
        id,
        name,
        email,
        token: token.to_string(),
    })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    context: ChatContext,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    response: String,
    messages: Vec<ChatMessage>,
    search_mode: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    if request.context.site_url.trim().is_empty() {
        return Err(ApiError::bad_request("context.siteUrl must not be empty"));
    }

    let outcome = state
        .chat
        .handle(user, request.messages, request.context)
        .await
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "chat turn failed");
            ApiError::internal("chat completion failed")
        })?;

    Ok(Json(ChatResponse {
        response: outcome.response,
        messages: outcome.messages,
        search_mode: outcome.search_mode.to_string(),
    }))
}

// ============ GET /api/me ============

async fn handle_me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let profile = state
        .provider
        .get_user_profile(&user.token)
        .await
        .map_err(provider_error)?;
    Ok(Json(serde_json::to_value(profile).unwrap_or_default()))
}

// ============ Indexer administration ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerQuery {
    site_url: Option<String>,
    days: Option<u32>,
    limit: Option<usize>,
}

impl IndexerQuery {
    fn pass_options(&self, skip_embeddings: bool) -> PassOptions {
        PassOptions {
            site_url: self.site_url.clone(),
            days_back: self.days.unwrap_or(DEFAULT_DAYS_BACK),
            skip_embeddings,
        }
    }
}

async fn trigger_pass(
    state: &AppState,
    query: &IndexerQuery,
    skip_embeddings: bool,
) -> Json<Value> {
    match state
        .scheduler
        .try_run(query.pass_options(skip_embeddings))
        .await
    {
        RunOutcome::Completed(report) => Json(json!({
            "status": "completed",
            "report": report,
        })),
        RunOutcome::AlreadyRunning => Json(json!({
            "status": "alreadyRunning",
            "message": "an indexing pass is already in progress",
        })),
    }
}

async fn handle_run(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<IndexerQuery>,
) -> Json<Value> {
    trigger_pass(&state, &query, false).await
}

async fn handle_test(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<IndexerQuery>,
) -> Json<Value> {
    trigger_pass(&state, &query, true).await
}

async fn handle_preview(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(query): Query<IndexerQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut documents = state
        .scheduler
        .pipeline()
        .discover(&query.pass_options(false))
        .await
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "candidate preview failed");
            ApiError::internal("candidate discovery failed")
        })?;
    documents.truncate(query.limit.unwrap_or(DEFAULT_PREVIEW_LIMIT));

    Ok(Json(json!({
        "count": documents.len(),
        "documents": documents,
    })))
}

async fn handle_stats(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let stats = state.index.stats().await.map_err(|e| {
        error!(error = %format!("{:#}", e), "stats lookup failed");
        ApiError::internal("index statistics unavailable")
    })?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_claims(claims: Value) -> String {
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("header.{}.signature", payload)
    }

    #[test]
    fn bearer_identity_reads_standard_claims() {
        let token = token_with_claims(json!({
            "oid": "user-1",
            "name": "Dana Reyes",
            "preferred_username": "dana@acme.com"
        }));
        let user = decode_bearer_identity(&token).unwrap();
        assert_eq!(user.id, "user-1");
        assert_eq!(user.name, "Dana Reyes");
        assert_eq!(user.email, "dana@acme.com");
        assert_eq!(user.token, token);
    }

    #[test]
    fn bearer_identity_falls_back_to_sub_and_email() {
        let token = token_with_claims(json!({
            "sub": "subject-7",
            "email": "s7@acme.com"
        }));
        let user = decode_bearer_identity(&token).unwrap();
        assert_eq!(user.id, "subject-7");
        assert_eq!(user.email, "s7@acme.com");
        assert_eq!(user.name, "s7@acme.com");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_bearer_identity("not-a-jwt").is_none());
        assert!(decode_bearer_identity("a.b.c").is_none());

        let no_subject = token_with_claims(json!({ "name": "nobody" }));
        assert!(decode_bearer_identity(&no_subject).is_none());
    }

    #[test]
    fn error_body_matches_the_contract() {
        let body = ApiError::bad_request("messages must not be empty").body();
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["error"], "bad_request");
        assert_eq!(body["message"], "messages must not be empty");
    }

    #[test]
    fn provider_denial_maps_to_forbidden() {
        let err = provider_error(ProviderError::Unauthorized("nope".to_string()));
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = provider_error(ProviderError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        // Upstream detail never leaks into the response body.
        assert!(!err.body()["message"]
            .as_str()
            .unwrap()
            .contains("bad gateway"));
    }
}
