//! Streaming session state machine.
//!
//! A session is `Open` while its connection is served, `Closing` once a
//! close was requested (explicitly, by a transport failure or because the
//! registry dropped it), and `Closed` after [`StreamSession::close`]. All
//! methods take `&self`, so the session can be shared between the task that
//! reads control messages and the task that pushes notifications.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::model::{Channel, ChannelSet, Notification};
use crate::presence::{self, PresenceHook};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{CloseReason, Delivery, Registration, WaiterRegistry};
use crate::store::NotificationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

pub struct StreamSession {
    id: Uuid,
    identity: Option<String>,
    registration: Registration,
    registry: Arc<WaiterRegistry>,
    store: Arc<NotificationStore>,
    presence: Arc<dyn PresenceHook>,
    publish_order: Arc<Mutex<()>>,
    state: Mutex<SessionState>,
    options: Mutex<Map<String, Value>>,
    last_activity: Mutex<Instant>,
}

impl StreamSession {
    pub(crate) fn new(
        identity: Option<String>,
        registration: Registration,
        registry: Arc<WaiterRegistry>,
        store: Arc<NotificationStore>,
        presence: Arc<dyn PresenceHook>,
        publish_order: Arc<Mutex<()>>,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(session_id = %id, consumer_id = registration.id(), "Stream session opened");
        Self {
            id,
            identity,
            registration,
            registry,
            store,
            presence,
            publish_order,
            state: Mutex::new(SessionState::Open),
            options: Mutex::new(Map::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn channels(&self) -> ChannelSet {
        self.registration.channels()
    }

    /// Id of the last notification handed to this session.
    pub fn cursor(&self) -> u64 {
        self.registration.cursor()
    }

    pub fn options(&self) -> Map<String, Value> {
        self.options.lock().clone()
    }

    /// Why the registry stopped delivering to this session, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.registration.closed()
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::SessionClosed)
        }
    }

    /// Start listening on `channel` and queue its stored history after the
    /// cursor. Returns false if already subscribed.
    ///
    /// Publishing is held off until the history is queued, so a live id can
    /// never overtake an older stored one.
    pub fn subscribe(&self, channel: Channel) -> BusResult<bool> {
        self.ensure_open()?;
        let _ordered = self.publish_order.lock();
        if !self.registry.subscribe(self.registration.id(), channel.clone()) {
            return Ok(false);
        }
        let only: ChannelSet = [channel.clone()].into_iter().collect();
        let history = self.store.read_since(&only, self.registration.cursor());
        let queued = self.catch_up(&history);
        debug!(session_id = %self.id, channel = %channel, queued, "Subscribed to channel");
        Ok(true)
    }

    /// Stop listening on `channel`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, channel: &Channel) -> BusResult<bool> {
        self.ensure_open()?;
        let removed = self.registry.unsubscribe(self.registration.id(), channel);
        if removed {
            debug!(session_id = %self.id, channel = %channel, "Unsubscribed from channel");
        }
        Ok(removed)
    }

    /// Merge client options. `last` moves the delivery baseline forward so a
    /// reconnecting client is not sent what it already has; it never moves it
    /// back, and a baseline ahead of the log is ignored.
    pub fn set_options(&self, options: Map<String, Value>, last: Option<u64>) -> BusResult<()> {
        self.ensure_open()?;
        presence::forward(&self.presence, self.identity.as_deref(), &options);
        self.options.lock().extend(options);
        if let Some(last) = last {
            self.registration.advance_cursor(self.store.resume_point(last));
        }
        Ok(())
    }

    /// Apply one control message and return the reply frame, if any.
    pub fn handle(&self, message: ClientMessage) -> BusResult<Option<ServerMessage>> {
        match message {
            ClientMessage::Subscribe { channel } => {
                self.subscribe(Channel::from_value(&channel)?)?;
                Ok(None)
            }
            ClientMessage::Unsubscribe { channel } => {
                self.unsubscribe(&Channel::from_value(&channel)?)?;
                Ok(None)
            }
            ClientMessage::Options { options, last } => {
                self.set_options(options, last)?;
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        }
    }

    /// Handle a raw text frame. Bad input produces an error frame and leaves
    /// the session open.
    pub fn handle_text(&self, text: &str) -> Option<ServerMessage> {
        self.touch();
        match ClientMessage::parse(text).and_then(|message| self.handle(message)) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(session_id = %self.id, error = %err, "Rejected control message");
                Some(ServerMessage::from_error(&err))
            }
        }
    }

    /// Re-read the store for anything this session should have but was not
    /// pushed. Returns how many entries were queued.
    pub fn resync(&self) -> usize {
        if !self.is_open() {
            return 0;
        }
        let _ordered = self.publish_order.lock();
        let channels = self.registration.channels();
        let batch = self.store.read_since(&channels, self.registration.cursor());
        self.catch_up(&batch)
    }

    // Caller holds `publish_order`.
    fn catch_up(&self, batch: &[Arc<Notification>]) -> usize {
        let room = self
            .registry
            .max_backlog()
            .saturating_sub(self.registration.pending_len());
        if batch.is_empty() || room == 0 {
            return 0;
        }
        // A catch-up larger than the backlog bound only replays its newest part.
        let skip = batch.len().saturating_sub(room);
        if skip > 0 {
            debug!(session_id = %self.id, skipped = skip, "Catch-up truncated to backlog bound");
            self.registration.advance_cursor(batch[skip - 1].id);
        }
        self.registry.backfill(&self.registration, &batch[skip..])
    }

    /// Wait for the next batch of notifications. `None` once the session is
    /// closing.
    pub async fn next_batch(&self) -> Option<Vec<Arc<Notification>>> {
        if !self.is_open() {
            return None;
        }
        match self.registration.wait().await {
            Delivery::Batch(batch) if self.is_open() => Some(batch),
            Delivery::Batch(_) => None,
            Delivery::Closed(reason) => {
                self.begin_close(reason);
                None
            }
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Enter `Closing`: stop deliveries and drop anything in flight.
    pub fn begin_close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return;
            }
            *state = SessionState::Closing;
        }
        self.registration.close(reason);
        self.registry.unregister(self.registration.id());
        debug!(session_id = %self.id, ?reason, "Stream session closing");
    }

    /// Finish the session. Idempotent.
    pub fn close(&self) {
        self.begin_close(CloseReason::Closed);
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = SessionState::Closed;
            info!(
                session_id = %self.id,
                reason = ?self.registration.closed(),
                cursor = self.registration.cursor(),
                "Stream session closed"
            );
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cursor", &self.cursor())
            .finish()
    }
}
