use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use crate::errors::ServiceError;
use crate::services::pos_sync::SyncReport;
use crate::{ApiResponse, ApiResult, AppState};

const API_KEY_HEADER: &str = "x-api-key";

/// POST /pos/sync
///
/// Runs the POS catalog sync. Guarded by a shared key: automation passes it
/// in the `x-api-key` header.
#[utoipa::path(
    post,
    path = "/api/v1/pos/sync",
    responses(
        (status = 200, description = "Sync report"),
        (status = 401, description = "Missing or wrong API key")
    ),
    tag = "pos"
)]
pub async fn run_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<SyncReport> {
    let expected = state
        .config
        .pos
        .sync_api_key
        .as_deref()
        .ok_or_else(|| ServiceError::Unauthorized("POS sync is not enabled".to_string()))?;

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("Missing API key".to_string()))?;

    if presented != expected {
        return Err(ServiceError::Unauthorized("Invalid API key".to_string()));
    }

    let report = state.services.pos_sync.run().await?;
    Ok(Json(ApiResponse::success(report)))
}
