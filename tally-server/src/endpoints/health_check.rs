//! A simple health check endpoint for the server.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tally_log::LogError;

use crate::service::ServiceState;

/// Response of the health check.
#[derive(Debug, Deserialize, Serialize)]
pub struct Status {
    /// `true` if the storage backend responds.
    pub is_healthy: bool,
}

/// Handles `GET /healthcheck`.
pub async fn handle(State(state): State<ServiceState>) -> impl IntoResponse {
    match state.engine().ping().await {
        Ok(()) => (StatusCode::OK, axum::Json(Status { is_healthy: true })),
        Err(error) => {
            tally_log::warn!("health check failed: {}", LogError(&error));
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(Status { is_healthy: false }),
            )
        }
    }
}
