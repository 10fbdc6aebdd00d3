use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::api::AppState;
use crate::dispatch::PreparedPrompt;
use crate::errors::{AppError, DispatchError};
use crate::models::credential::{CredentialStatus, ValidationOutcome};
use crate::models::framework::FrameworkTemplate;
use crate::models::generation::{GenerationRequest, GenerationResult};
use crate::models::history::{HistoryOutcome, HistoryRow, NewHistoryEntry};
use crate::models::provider::Provider;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct PreviewParams {
    pub task_description: String,
    pub tone: Option<String>,
    pub length: Option<String>,
    #[serde(default)]
    pub vibe_coding: bool,
}

#[derive(Serialize)]
pub struct PreviewResponse {
    pub framework_id: &'static str,
    pub body: String,
}

#[derive(Serialize)]
pub struct ConfiguredResponse {
    pub providers: BTreeSet<Provider>,
    pub has_any: bool,
}

#[derive(Deserialize)]
pub struct SaveCredentialRequest {
    pub api_key: String,
}

#[derive(Serialize)]
pub struct GenerateResponse {
    pub history_id: Uuid,
    #[serde(flatten)]
    pub result: GenerationResult,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Deserialize)]
pub struct PaginationParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_provider(raw: &str) -> Result<Provider, AppError> {
    Ok(raw.parse::<Provider>()?)
}

// ── Frameworks ───────────────────────────────────────────────

/// GET /api/v1/frameworks
pub async fn list_frameworks(State(state): State<Arc<AppState>>) -> Json<&'static [FrameworkTemplate]> {
    Json(state.dispatcher.frameworks().list())
}

/// GET /api/v1/frameworks/:id
pub async fn get_framework(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<&'static FrameworkTemplate>, AppError> {
    state
        .dispatcher
        .frameworks()
        .get(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("framework '{}'", id)))
}

/// GET /api/v1/frameworks/:id/preview (render only, no provider call)
pub async fn preview_framework(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<PreviewParams>,
) -> Result<Json<PreviewResponse>, AppError> {
    let req = GenerationRequest {
        framework_id: id,
        task_description: params.task_description,
        tone: params.tone,
        length: params.length,
        vibe_coding: params.vibe_coding,
    };
    let prepared = state.dispatcher.prepare(&req)?;
    Ok(Json(PreviewResponse {
        framework_id: prepared.framework.id,
        body: prepared.body,
    }))
}

// ── Credentials ──────────────────────────────────────────────

/// GET /api/v1/credentials
pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ConfiguredResponse>, AppError> {
    let providers = state.credentials.list_configured(user.user_id).await?;
    Ok(Json(ConfiguredResponse {
        has_any: !providers.is_empty(),
        providers,
    }))
}

/// GET /api/v1/credentials/status
pub async fn credential_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<CredentialStatus>>, AppError> {
    Ok(Json(state.credentials.list_status(user.user_id).await?))
}

/// PUT /api/v1/credentials/:provider
pub async fn save_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
    Json(payload): Json<SaveCredentialRequest>,
) -> Result<StatusCode, AppError> {
    let provider = parse_provider(&provider)?;
    state
        .credentials
        .save(user.user_id, provider, &payload.api_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/credentials/:provider
pub async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    let provider = parse_provider(&provider)?;
    state.credentials.delete(user.user_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/credentials/:provider/activate
pub async fn activate_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<StatusCode, AppError> {
    let provider = parse_provider(&provider)?;
    state.credentials.set_active(user.user_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/credentials/:provider/validate
pub async fn validate_credential(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(provider): Path<String>,
) -> Result<Json<ValidationOutcome>, AppError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.credentials.validate(user.user_id, provider).await?))
}

// ── Generation ───────────────────────────────────────────────

/// POST /api/v1/generate
///
/// Bad input and unknown frameworks are rejected before anything is
/// recorded. The provider call runs on its own task so the history row is
/// completed even if the client disconnects; a newer request from the same
/// user cancels this one.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let prepared = state.dispatcher.prepare(&req)?;

    let entry = NewHistoryEntry::from_request(user.user_id, prepared.framework.display_name, &req);
    let history_id = state.history.insert_history(&entry).await?;

    let task_state = state.clone();
    let result = tokio::spawn(async move {
        run_generation(task_state, user.user_id, history_id, prepared).await
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("generation task failed: {}", e)))??;

    Ok(Json(GenerateResponse { history_id, result }))
}

async fn run_generation(
    state: Arc<AppState>,
    user_id: Uuid,
    history_id: Uuid,
    prepared: PreparedPrompt,
) -> Result<GenerationResult, DispatchError> {
    let (ticket, registration) = state.inflight.begin(user_id);
    let result = state
        .dispatcher
        .dispatch_prepared(user_id, &prepared, Some(registration))
        .await;
    state.inflight.finish(ticket);

    let outcome = HistoryOutcome::from_result(&result);
    match state.history.complete_history(user_id, history_id, &outcome).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!(%history_id, "history row was not pending"),
        Err(e) => tracing::error!(%history_id, "failed to complete history row: {}", e),
    }

    result
}

/// POST /api/v1/generate/cancel
pub async fn cancel_generation(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.inflight.cancel(user.user_id),
    })
}

// ── History ──────────────────────────────────────────────────

/// GET /api/v1/history, newest first
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Vec<HistoryRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);

    let rows = state
        .history
        .list_history(user.user_id, limit, offset)
        .await?;
    Ok(Json(rows))
}
