//! An HTML page listing all stored metrics.

use std::fmt::Write;

use axum::extract::State;
use axum::response::{Html, IntoResponse};

use crate::endpoints::common::BadUpdate;
use crate::service::ServiceState;

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Handles `GET /` with one `name: value` line per live metric.
pub async fn handle(State(state): State<ServiceState>) -> Result<impl IntoResponse, BadUpdate> {
    let metrics = state.engine().list().await?;

    let mut body = String::from("<!DOCTYPE html>\n<html>\n<body>\n");
    for metric in metrics {
        writeln!(body, "<p>{}: {}</p>", escape(&metric.name), metric.value).ok();
    }
    body.push_str("</body>\n</html>\n");

    Ok(Html(body))
}
