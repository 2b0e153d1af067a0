//! Long-polling endpoints.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use pollbus_core::{parse_channels, Channel, Notification, PollOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::error_response;
use crate::state::{identity_from, AppState};

#[derive(Deserialize)]
pub struct SendRequest {
    pub channel: Value,
    pub message: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SendResponse {
    pub id: u64,
}

#[derive(Deserialize)]
pub struct PollRequest {
    pub channels: Vec<Value>,
    #[serde(default)]
    pub last: u64,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Optional wait in seconds; the configured default applies otherwise.
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub async fn send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, (StatusCode, String)> {
    let channel = Channel::from_value(&req.channel).map_err(error_response)?;
    let id = state.bus.publish(channel, req.message);
    Ok(Json(SendResponse { id }))
}

pub async fn poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PollRequest>,
) -> Result<Json<Vec<Arc<Notification>>>, (StatusCode, String)> {
    let channels = parse_channels(&req.channels).map_err(error_response)?;
    let timeout = req
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.bus.config().poll_timeout());
    let options = PollOptions {
        identity: identity_from(&headers),
        options: req.options,
    };

    debug!(channels = channels.len(), last = req.last, ?timeout, "Long-poll started");
    let notifications = state
        .bus
        .poll(channels, req.last, timeout, options)
        .await
        .map_err(error_response)?;
    debug!(count = notifications.len(), "Long-poll finished");

    Ok(Json(notifications))
}
