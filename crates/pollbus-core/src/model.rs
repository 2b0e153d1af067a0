//! Notification and channel types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{BusError, BusResult};

/// Opaque routing key. The bus only ever compares channels for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// Create a channel from a name. Empty names are rejected.
    pub fn new(name: impl Into<String>) -> BusResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BusError::InvalidChannel);
        }
        Ok(Self(name))
    }

    /// Validate a caller-supplied JSON value as a channel.
    ///
    /// Only strings are accepted; numbers, arrays and objects are rejected
    /// before they can reach the store.
    pub fn from_value(value: &Value) -> BusResult<Self> {
        match value {
            Value::String(s) => Self::new(s.as_str()),
            _ => Err(BusError::InvalidChannel),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = BusError;

    fn try_from(value: String) -> BusResult<Self> {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Set of channels a consumer listens on.
pub type ChannelSet = BTreeSet<Channel>;

/// Validate a list of caller-supplied channels. A single bad entry rejects the
/// whole list.
pub fn parse_channels(values: &[Value]) -> BusResult<ChannelSet> {
    values.iter().map(Channel::from_value).collect()
}

/// A published message. Immutable once appended to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub channel: Channel,
    pub message: Value,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_from_value() {
        assert_eq!(Channel::from_value(&json!("c1")).unwrap().as_str(), "c1");
        assert!(matches!(
            Channel::from_value(&json!(42)),
            Err(BusError::InvalidChannel)
        ));
        assert!(Channel::from_value(&json!(["db", "res.partner", 7])).is_err());
        assert!(Channel::from_value(&json!("")).is_err());
    }

    #[test]
    fn test_parse_channels_rejects_mixed() {
        let ok = parse_channels(&[json!("a"), json!("b"), json!("a")]).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(parse_channels(&[json!("a"), json!(null)]).is_err());
    }

    #[test]
    fn test_notification_wire_shape() {
        let n = Notification {
            id: 3,
            channel: Channel::new("c1").unwrap(),
            message: json!({"k": "v"}),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value, json!({"id": 3, "channel": "c1", "message": {"k": "v"}}));
    }
}
