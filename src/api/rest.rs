// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Strictly read-only: the dashboard observes the engine, it never drives
// it. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;

/// Build the admin router with CORS and shared engine state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/account", get(account))
        .route("/api/trades", get(trades))
        .route("/api/percentiles", get(percentiles))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/failures", get(failures))
        .route("/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(engine)
}

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    // The account read doubles as a database liveness probe.
    let db_ok = engine.account_snapshot().is_ok();
    let body = serde_json::json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "database": if db_ok { "healthy" } else { "unhealthy" },
        "server_time": chrono::Utc::now().to_rfc3339(),
    });
    Json(body)
}

async fn account(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.account_snapshot() {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct TradesQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    50
}

async fn trades(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    match engine.recent_trades(query.limit.min(500), query.offset) {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => error_response(e),
    }
}

async fn percentiles(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.all_percentiles() {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => error_response(e),
    }
}

async fn scheduler_status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.status())
}

async fn failures(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.parked_failures())
}

fn error_response(e: anyhow::Error) -> axum::response::Response {
    let body = serde_json::json!({ "error": format!("{e:#}") });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
