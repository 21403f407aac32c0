//! Checks that the storage backend is reachable.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::endpoints::common::BadUpdate;
use crate::service::ServiceState;

/// Handles `GET /ping`.
pub async fn handle(State(state): State<ServiceState>) -> Result<impl IntoResponse, BadUpdate> {
    state.engine().ping().await?;
    Ok(StatusCode::OK)
}
