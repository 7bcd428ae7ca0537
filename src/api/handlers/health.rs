use crate::AppState;
use crate::services::session_pool::PoolStats;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub dispatch_mode: String,
    pub pending_jobs: usize,
    pub pool: PoolStats,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Gateway health and session pool state", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.stats();
    let status = if pool.closed { "shutting_down" } else { "ok" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dispatch_mode: state.dispatcher.mode().as_str().to_string(),
        pending_jobs: state.dispatcher.pending_jobs(),
        pool,
    })
}
