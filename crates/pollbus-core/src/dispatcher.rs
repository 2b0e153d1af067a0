//! Public entry point of the bus.
//!
//! One `Dispatcher` is built at startup and shared (`Arc`) by every request
//! handler and streaming connection. It owns the notification store and the
//! waiter registry.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::model::{Channel, ChannelSet, Notification};
use crate::presence::{self, PresenceHook, TracingPresence};
use crate::registry::{CloseReason, ConsumerKind, Delivery, WaiterRegistry};
use crate::session::StreamSession;
use crate::store::NotificationStore;

/// Caller context attached to a long-poll.
#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Identity of the polling user, used only for presence updates.
    pub identity: Option<String>,
    /// Client options, e.g. `bus_inactivity`.
    pub options: Map<String, Value>,
}

/// Snapshot of bus state for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub last_id: u64,
    pub oldest_id: Option<u64>,
    pub retained: usize,
    pub consumers: usize,
}

pub struct Dispatcher {
    config: BusConfig,
    store: Arc<NotificationStore>,
    registry: Arc<WaiterRegistry>,
    presence: Arc<dyn PresenceHook>,
    // Held across append + fan-out so consumers see ids in order. Sessions
    // take it too while backfilling history.
    publish_order: Arc<Mutex<()>>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: BusConfig) -> Self {
        Self::with_presence(config, Arc::new(TracingPresence))
    }

    pub fn with_presence(config: BusConfig, presence: Arc<dyn PresenceHook>) -> Self {
        Self {
            store: Arc::new(NotificationStore::new(config.retention.clone())),
            registry: Arc::new(WaiterRegistry::new(config.max_backlog)),
            presence,
            publish_order: Arc::new(Mutex::new(())),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WaiterRegistry> {
        &self.registry
    }

    fn ensure_running(&self) -> BusResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(BusError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Publish `message` on `channel` and return its sequence id.
    pub fn publish(&self, channel: Channel, message: Value) -> u64 {
        let _ordered = self.publish_order.lock();
        let notification = self.store.append(channel, message);
        let woken = self.registry.notify(&notification);
        debug!(
            id = notification.id,
            channel = %notification.channel,
            woken,
            "Notification published"
        );
        notification.id
    }

    /// Publish several messages, returning their ids in order.
    pub fn publish_many<I>(&self, messages: I) -> Vec<u64>
    where
        I: IntoIterator<Item = (Channel, Value)>,
    {
        messages
            .into_iter()
            .map(|(channel, message)| self.publish(channel, message))
            .collect()
    }

    /// Long-poll for notifications after `last_seen_id` on `channels`.
    ///
    /// Returns at once if the store already has matching entries, otherwise
    /// waits up to `timeout` (clamped to the configured maximum). A timeout
    /// yields an empty vector. Dropping the returned future unregisters the
    /// waiter.
    pub async fn poll(
        &self,
        channels: ChannelSet,
        last_seen_id: u64,
        timeout: Duration,
        options: PollOptions,
    ) -> BusResult<Vec<Arc<Notification>>> {
        self.ensure_running()?;
        presence::forward(&self.presence, options.identity.as_deref(), &options.options);
        let last_seen_id = self.store.resume_point(last_seen_id);

        if self.store.is_truncated(last_seen_id) {
            debug!(
                last_seen_id,
                oldest = self.store.oldest_id(),
                "Poll cursor is older than retained history"
            );
        }

        let ready = self.store.read_since(&channels, last_seen_id);
        if !ready.is_empty() {
            return Ok(ready);
        }

        let waiter = self
            .registry
            .register(ConsumerKind::Waiter, channels.clone(), last_seen_id);
        // Anything published between the first read and registration is
        // only visible in the store.
        let ready = self.store.read_since(&channels, last_seen_id);
        if !ready.is_empty() {
            return Ok(ready);
        }

        let timeout = timeout.min(self.config.max_poll_timeout());
        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Delivery::Batch(batch)) => Ok(batch),
            Ok(Delivery::Closed(CloseReason::BacklogExceeded)) => Err(BusError::BacklogExceeded {
                limit: self.config.max_backlog,
            }),
            Ok(Delivery::Closed(_)) => Err(BusError::ShuttingDown),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Open a streaming session with no subscriptions. Its cursor starts at
    /// zero; clients resuming a previous session raise it with the `last`
    /// field of an `options` message.
    pub fn open_session(&self, identity: Option<String>) -> BusResult<StreamSession> {
        self.ensure_running()?;
        let registration = self
            .registry
            .register(ConsumerKind::Session, ChannelSet::new(), 0);
        Ok(StreamSession::new(
            identity,
            registration,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.presence),
            Arc::clone(&self.publish_order),
        ))
    }

    pub fn close_session(&self, session: &StreamSession) {
        session.close();
    }

    /// Run the retention policy once.
    pub fn trim(&self) -> usize {
        let floor = self.registry.min_waiter_cursor();
        self.store.trim(Utc::now(), floor)
    }

    /// Start the periodic trim task. It stops when the dispatcher is dropped
    /// or shut down.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.trim_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(dispatcher) = weak.upgrade() else { break };
                if dispatcher.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                dispatcher.trim();
            }
            debug!("Maintenance task stopped");
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            last_id: self.store.last_id(),
            oldest_id: self.store.oldest_id(),
            retained: self.store.len(),
            consumers: self.registry.len(),
        }
    }

    /// Refuse new work and release every waiter and session.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.registry.close_all(CloseReason::Shutdown);
        if closed > 0 {
            warn!(closed, "Closed consumers on shutdown");
        }
        info!(last_id = self.store.last_id(), "Dispatcher shut down");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
