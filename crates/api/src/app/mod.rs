//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: storage, executor and orchestrator wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs (camelCase JSON)
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use backfill_infra::jobs::BackfillOrchestrator;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over an orchestrator.
pub fn build_app(orchestrator: Arc<BackfillOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/ready", get(routes::system::ready))
        .nest("/backfill", routes::router())
        .layer(Extension(orchestrator))
}
