use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::AppState;
use crate::catalog::load_catalog;

/// GET /api/remotes - every valid layout, fewest buttons first
pub async fn list_remotes(State(state): State<AppState>) -> Response {
    match load_catalog(&state.server_config.remotes_dir).await {
        Ok(layouts) => Json(layouts).into_response(),
        Err(e) => {
            error!("Failed to load remote catalog: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error reading remotes directory",
            )
                .into_response()
        }
    }
}
