//! Health endpoint.

use axum::{extract::State, Json};
use pollbus_core::BusStats;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<BusStats> {
    Json(state.bus.stats())
}
