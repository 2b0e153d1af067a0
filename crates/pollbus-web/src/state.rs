//! Application state.

use axum::http::HeaderMap;
use pollbus_core::Dispatcher;
use std::sync::Arc;

/// Header carrying the caller identity forwarded to presence updates.
pub const IDENTITY_HEADER: &str = "x-bus-identity";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(bus: Arc<Dispatcher>) -> Self {
        Self { bus }
    }
}

/// Caller identity supplied by the fronting session layer, if any.
pub fn identity_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
