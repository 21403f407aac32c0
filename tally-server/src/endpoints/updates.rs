//! Batch ingestion used by the agent.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::endpoints::common::{self, BadUpdate};
use crate::extractors::{ClientIp, SignedBody};
use crate::service::ServiceState;

/// Handles `POST /updates` with a JSON array of records.
pub async fn handle(
    State(state): State<ServiceState>,
    client: ClientIp,
    SignedBody(body): SignedBody,
) -> Result<impl IntoResponse, BadUpdate> {
    let batch = tally_metrics::parse_batch(&body)?;
    common::apply_batch(&state, &batch, client).await?;
    Ok(StatusCode::OK)
}
