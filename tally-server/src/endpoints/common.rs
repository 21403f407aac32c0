//! Common facilities for ingestion endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tally_log::LogError;
use tally_metrics::{DecodeError, Metric, ParseMetricError};

use crate::extractors::{ClientIp, PayloadError};
use crate::service::ServiceState;
use crate::services::audit::AuditEvent;
use crate::store::StoreError;
use crate::utils::ApiErrorResponse;

/// An error that rejects an update or lookup request.
#[derive(Debug, thiserror::Error)]
pub enum BadUpdate {
    /// The raw payload was rejected before decoding.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The decoded body is not a valid record or batch.
    #[error("invalid metric payload")]
    Decode(#[from] DecodeError),

    /// A URL parameter is not a valid metric type, name or value.
    #[error("invalid metric")]
    Parse(#[from] ParseMetricError),

    /// The store rejected or failed the request.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A response body could not be serialized.
    #[error("could not serialize response")]
    Serialize(#[source] serde_json::Error),
}

impl BadUpdate {
    /// Returns the status code of the error response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Payload(error) => error.status(),
            Self::Decode(DecodeError::TooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Parse(ParseMetricError::EmptyName) => StatusCode::NOT_FOUND,
            Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::TypeConflict { .. }) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BadUpdate {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tally_log::error!("failed to handle metrics request: {}", LogError(&self));
        } else {
            tally_log::debug!("rejected metrics request: {}", LogError(&self));
        }

        (status, ApiErrorResponse::from_error(&self)).into_response()
    }
}

/// Applies a batch to the store and emits an audit event naming every metric of the batch.
///
/// Returns the stored metrics in batch order. Nothing is audited if the batch fails.
pub async fn apply_batch(
    state: &ServiceState,
    batch: &[Metric],
    client: ClientIp,
) -> Result<Vec<Metric>, BadUpdate> {
    let stored = state.engine().upsert(batch).await?;
    tally_log::trace!("applied {} metrics", stored.len());

    if state.audit().is_enabled() {
        let names = batch.iter().map(|metric| metric.name.clone()).collect();
        state
            .audit()
            .log(AuditEvent::new(names, client.into_inner()));
    }

    Ok(stored)
}
