use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    let transports = metrics::TransportHealth {
        links_configured: state.links.slots().len() as u64,
        links_connected: state.links.connected_count().await as u64,
        broker_configured: state.broker.is_some(),
        broker_connected: state.broker.as_ref().is_some_and(|b| b.is_connected()),
    };

    let status = if transports.is_degraded() {
        "degraded"
    } else {
        "healthy"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        instances: state.hub.registry().len().await as u64,
        sessions: metrics.sessions.active,
        transports,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
