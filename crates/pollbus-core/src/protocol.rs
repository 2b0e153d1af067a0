//! Streaming wire protocol.
//!
//! Text frames carry JSON objects tagged by `type`:
//!
//! | direction | message |
//! |-----------|---------|
//! | client → server | `{"type":"subscribe","channel":C}` |
//! | client → server | `{"type":"unsubscribe","channel":C}` |
//! | client → server | `{"type":"options","options":{..},"last":N}` |
//! | client → server | `{"type":"ping"}` |
//! | server → client | `{"type":"pong"}` |
//! | server → client | `{"type":"notification","notifications":[{"id","channel","message"}]}` |
//! | server → client | `{"type":"error","message":M}` |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{BusError, BusResult};
use crate::model::Notification;

/// Control message sent by a streaming client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        channel: Value,
    },
    Unsubscribe {
        channel: Value,
    },
    Options {
        #[serde(default)]
        options: Map<String, Value>,
        #[serde(default)]
        last: Option<u64>,
    },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> BusResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| BusError::malformed("Invalid JSON"))?;
        serde_json::from_value(value).map_err(|e| BusError::malformed(e.to_string()))
    }
}

/// Message pushed to a streaming client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Pong,
    Notification {
        notifications: Vec<Arc<Notification>>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Error frame for a failed control message. Malformed input is echoed
    /// with its bare description, as clients expect `Invalid JSON`.
    pub fn from_error(err: &BusError) -> Self {
        match err {
            BusError::MalformedMessage(msg) => Self::error(msg.clone()),
            other => Self::error(other.to_string()),
        }
    }

    pub fn to_text(&self) -> BusResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
