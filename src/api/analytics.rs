use std::sync::Arc;

use axum::{extract::State, Extension, Json};

use crate::api::auth::AuthUser;
use crate::api::AppState;
use crate::errors::AppError;
use crate::models::history::HistorySummary;

/// GET /api/v1/analytics/summary: generation counts by framework, provider and status
pub async fn get_summary(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<HistorySummary>, AppError> {
    let summary = state
        .history
        .history_summary(user.user_id)
        .await
        .map_err(|e| {
            tracing::error!("history_summary failed: {}", e);
            AppError::Internal(e)
        })?;

    Ok(Json(summary))
}
