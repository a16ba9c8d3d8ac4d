use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use backfill_infra::jobs::BackfillOrchestrator;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// 200 once startup recovery is done and storage answers, 503 before.
pub async fn ready(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
) -> axum::response::Response {
    if orchestrator.is_ready().await {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
            .into_response()
    }
}
