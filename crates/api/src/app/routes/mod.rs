use axum::Router;

pub mod jobs;
pub mod rate_limit;
pub mod system;

/// Router for the `/backfill` endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(jobs::router())
        .merge(rate_limit::router())
}
