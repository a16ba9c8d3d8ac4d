use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use backfill_core::JobId;
use backfill_infra::jobs::BackfillOrchestrator;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .route("/preview", post(preview_job))
}

fn parse_request(
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> Result<backfill_core::JobConfig, axum::response::Response> {
    let Json(body) = body.map_err(|e| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.body_text())
    })?;
    body.into_config().map_err(errors::domain_error_to_response)
}

fn parse_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse().map_err(errors::domain_error_to_response)
}

pub async fn create_job(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let config = match parse_request(body) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match orchestrator.create_job(config).await {
        Ok(created) => {
            info!(job_id = %created.job_id, "job accepted");
            (
                StatusCode::CREATED,
                Json(dto::CreatedJobResponse::from(created)),
            )
                .into_response()
        }
        Err(e) => errors::backfill_error_to_response(e),
    }
}

pub async fn preview_job(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let config = match parse_request(body) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match orchestrator.preview(config).await {
        Ok(preview) => Json(dto::PreviewResponse::from(preview)).into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let filter = match query.filter() {
        Ok(f) => f,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match orchestrator.list_jobs(&filter, query.pagination()).await {
        Ok(page) => Json(dto::JobListResponse::from(page)).into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match orchestrator.get_job(job_id).await {
        Ok(job) => Json(dto::JobResponse::from(job)).into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(orchestrator): Extension<Arc<BackfillOrchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match orchestrator.cancel_job(job_id).await {
        Ok(cancelled) => Json(serde_json::json!({
            "jobId": job_id,
            "cancelled": cancelled,
        }))
        .into_response(),
        Err(e) => errors::backfill_error_to_response(e),
    }
}
