//! Updates of a single metric.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tally_metrics::{Metric, MetricRecord, MetricType, MetricValue, ParseMetricError};

use crate::endpoints::common::{self, BadUpdate};
use crate::extractors::{ClientIp, SignedBody};
use crate::service::ServiceState;

/// Handles `POST /update` with a single JSON record.
///
/// Responds with the stored record after the update.
pub async fn handle(
    State(state): State<ServiceState>,
    client: ClientIp,
    SignedBody(body): SignedBody,
) -> Result<impl IntoResponse, BadUpdate> {
    let metric = tally_metrics::parse_record(&body)?;
    apply_single(&state, metric, client).await
}

/// Handles `POST /update/{type}/{name}/{value}`.
pub async fn handle_path(
    State(state): State<ServiceState>,
    client: ClientIp,
    Path((ty, name, value)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, BadUpdate> {
    let ty = ty.parse::<MetricType>()?;
    if name.is_empty() {
        return Err(ParseMetricError::EmptyName.into());
    }

    let metric = Metric::new(name, MetricValue::parse(ty, &value)?);
    apply_single(&state, metric, client).await
}

async fn apply_single(
    state: &ServiceState,
    metric: Metric,
    client: ClientIp,
) -> Result<Json<MetricRecord>, BadUpdate> {
    let stored = common::apply_batch(state, std::slice::from_ref(&metric), client).await?;
    let stored = stored.first().unwrap_or(&metric);
    Ok(Json(MetricRecord::from(stored)))
}
