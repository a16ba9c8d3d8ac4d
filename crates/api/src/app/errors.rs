use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use backfill_core::DomainError;
use backfill_infra::executors::ExecutorError;
use backfill_infra::jobs::BackfillError;
use backfill_infra::storage::StorageError;

pub fn backfill_error_to_response(err: BackfillError) -> axum::response::Response {
    match err {
        BackfillError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        BackfillError::Domain(DomainError::InvalidId(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_id", msg)
        }
        BackfillError::Domain(DomainError::Conflict {
            active_job_id,
            status,
        }) => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "conflict",
                "message": format!("job {active_job_id} is {status}"),
                "activeJobId": active_job_id,
                "activeJobStatus": status,
            })),
        )
            .into_response(),
        BackfillError::Domain(DomainError::NotFound(id))
        | BackfillError::Storage(StorageError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        BackfillError::Domain(e @ DomainError::InvalidTransition { .. }) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        BackfillError::Storage(e @ StorageError::AlreadyTerminal { .. }) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        BackfillError::Executor(ExecutorError::Unregistered(job_type)) => json_error(
            StatusCode::BAD_REQUEST,
            "unsupported_job_type",
            format!("no executor configured for {job_type}"),
        ),
        BackfillError::Executor(e) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "executor_error", e.to_string())
        }
        BackfillError::NotReady => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "startup recovery has not finished",
        ),
        BackfillError::Storage(e) => {
            tracing::error!(error = %e, "storage error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    backfill_error_to_response(err.into())
}
