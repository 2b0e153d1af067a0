//! Presence forwarding.
//!
//! Pollers and sessions may report how long their user has been inactive.
//! The bus does not interpret it; it hands the value to a [`PresenceHook`]
//! without waiting for the result.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Option key carrying the client's inactivity in milliseconds.
pub const INACTIVITY_OPTION: &str = "bus_inactivity";

/// External presence collaborator.
#[async_trait]
pub trait PresenceHook: Send + Sync {
    async fn update(&self, identity: &str, inactivity_ms: u64);
}

/// Default hook: records the update in the trace log only.
#[derive(Debug, Default, Clone)]
pub struct TracingPresence;

#[async_trait]
impl PresenceHook for TracingPresence {
    async fn update(&self, identity: &str, inactivity_ms: u64) {
        debug!(identity, inactivity_ms, "Presence update");
    }
}

/// Read the inactivity hint from a client options map.
pub fn inactivity_from(options: &Map<String, Value>) -> Option<u64> {
    options.get(INACTIVITY_OPTION).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    })
}

/// Fire-and-forget presence update. Does nothing without an identity or an
/// inactivity hint, or outside a tokio runtime.
pub fn forward(
    hook: &Arc<dyn PresenceHook>,
    identity: Option<&str>,
    options: &Map<String, Value>,
) -> bool {
    let (Some(identity), Some(inactivity_ms)) = (identity, inactivity_from(options)) else {
        return false;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return false;
    };
    let hook = Arc::clone(hook);
    let identity = identity.to_string();
    runtime.spawn(async move {
        hook.update(&identity, inactivity_ms).await;
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, u64)>>);

    #[async_trait]
    impl PresenceHook for Recorder {
        async fn update(&self, identity: &str, inactivity_ms: u64) {
            self.0.lock().push((identity.to_string(), inactivity_ms));
        }
    }

    fn options(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_inactivity_parsing() {
        assert_eq!(inactivity_from(&options(json!({"bus_inactivity": 1500}))), Some(1500));
        assert_eq!(inactivity_from(&options(json!({"bus_inactivity": 12.7}))), Some(12));
        assert_eq!(inactivity_from(&options(json!({"bus_inactivity": "x"}))), None);
        assert_eq!(inactivity_from(&options(json!({}))), None);
    }

    #[tokio::test]
    async fn test_forward_requires_identity_and_hint() {
        let recorder = Arc::new(Recorder::default());
        let hook: Arc<dyn PresenceHook> = recorder.clone();

        assert!(!forward(&hook, None, &options(json!({"bus_inactivity": 5}))));
        assert!(!forward(&hook, Some("u1"), &options(json!({}))));
        assert!(forward(&hook, Some("u1"), &options(json!({"bus_inactivity": 5}))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.0.lock().as_slice(), &[("u1".to_string(), 5)]);
    }
}
