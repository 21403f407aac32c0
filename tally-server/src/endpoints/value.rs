//! Lookups of stored metrics.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tally_auth::SIGNATURE_HEADER;
use tally_metrics::{Metric, MetricRecord, MetricType};

use crate::endpoints::common::BadUpdate;
use crate::service::ServiceState;
use crate::store::StoreError;

/// Body of a `POST /value` request.
#[derive(Debug, Deserialize)]
pub struct MetricLookup {
    id: String,
    #[serde(rename = "type")]
    ty: MetricType,
}

async fn lookup(state: &ServiceState, ty: MetricType, name: &str) -> Result<Metric, BadUpdate> {
    // A metric stored with a different type is reported as missing.
    match state.engine().get(name).await? {
        Some(metric) if metric.ty() == ty => Ok(metric),
        _ => Err(StoreError::NotFound.into()),
    }
}

/// Handles `GET /value/{type}/{name}` with the value as plain text.
pub async fn handle(
    State(state): State<ServiceState>,
    Path((ty, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, BadUpdate> {
    let ty = ty.parse::<MetricType>()?;
    let metric = lookup(&state, ty, &name).await?;
    Ok(metric.value.to_string())
}

/// Handles `POST /value` with a JSON lookup and responds with the full record.
///
/// If a shared key is configured, the response carries the signature of its body.
pub async fn handle_json(
    State(state): State<ServiceState>,
    Json(request): Json<MetricLookup>,
) -> Result<Response, BadUpdate> {
    let metric = lookup(&state, request.ty, &request.id).await?;
    let body = serde_json::to_vec(&MetricRecord::from(&metric)).map_err(BadUpdate::Serialize)?;
    let signature = state.shared_key().map(|key| key.sign(&body));

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    if let Some(signature) = signature {
        // Hex digests are always valid header values.
        if let Ok(value) = HeaderValue::from_str(signature.as_str()) {
            headers.insert(SIGNATURE_HEADER, value);
        }
    }

    Ok(response)
}
