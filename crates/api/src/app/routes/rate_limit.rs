use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use backfill_infra::jobs::BackfillOrchestrator;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/rate-limit", get(get_rate_limit).put(update_rate_limit))
}

pub async fn get_rate_limit(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
) -> axum::response::Response {
    match orchestrator.rate_limit_config().await {
        Ok(config) => Json(dto::RateLimitResponse::from(config)).into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}

/// Fields present in the body replace the current values; the rest are kept.
pub async fn update_rate_limit(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    body: Result<Json<dto::RateLimitOverridesDto>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text());
        }
    };
    let current = match orchestrator.rate_limit_config().await {
        Ok(c) => c,
        Err(e) => return errors::backfill_error_to_response(e),
    };
    let updated = current.with_overrides(Some(&body.into()));
    match orchestrator.set_rate_limit_config(updated).await {
        Ok(config) => Json(dto::RateLimitResponse::from(config)).into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}
