//! Route handlers.

pub mod health;
pub mod longpolling;

use axum::http::StatusCode;
use pollbus_core::BusError;

/// Map a bus error to the status returned to HTTP callers.
pub(crate) fn error_response(err: BusError) -> (StatusCode, String) {
    let status = match &err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        BusError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        BusError::BacklogExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
