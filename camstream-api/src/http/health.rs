//! Health check endpoint

use axum::{response::IntoResponse, routing::get, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Liveness probe; OK whenever the server is accepting requests
pub async fn health_check() -> impl IntoResponse {
    "OK"
}
