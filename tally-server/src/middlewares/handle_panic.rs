use std::any::Any;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
pub use tower_http::catch_panic::CatchPanicLayer;

use crate::utils::ApiErrorResponse;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    match payload.downcast_ref::<String>() {
        Some(message) => message,
        None => payload
            .downcast_ref::<&str>()
            .copied()
            .unwrap_or("no panic message"),
    }
}

/// Turns a panicking handler into a 500, which agents treat as retryable.
///
/// The panic message is logged but not returned, since it may expose internals of the store.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    tally_log::error!("handler panicked: {}", panic_message(payload.as_ref()));

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiErrorResponse::with_detail("internal server error"),
    )
        .into_response()
}
