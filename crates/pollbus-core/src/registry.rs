//! Registry of consumers waiting for notifications.
//!
//! Every long-poll waiter and streaming session is a [`Consumer`] indexed by
//! each channel it listens on. Publishing fans a notification out to the
//! matching consumers' pending buffers and wakes them; it never waits on a
//! consumer. A consumer whose buffer grows past the backlog bound is closed
//! and dropped from the index.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::model::{Channel, ChannelSet, Notification};

pub type ConsumerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// A blocked long-poll call.
    Waiter,
    /// A streaming session.
    Session,
}

/// Why a consumer stopped receiving notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    BacklogExceeded,
    Closed,
    Shutdown,
}

/// Result of waiting on a consumer.
#[derive(Debug)]
pub enum Delivery {
    Batch(Vec<Arc<Notification>>),
    Closed(CloseReason),
}

#[derive(Debug, PartialEq, Eq)]
enum Offer {
    Queued,
    Skipped,
    Overflow,
}

#[derive(Debug)]
struct ConsumerState {
    channels: ChannelSet,
    // Highest id handed out; nothing at or below it is queued again.
    cursor: u64,
    // Sorted by id, all ids > cursor.
    pending: Vec<Arc<Notification>>,
    closed: Option<CloseReason>,
}

#[derive(Debug)]
pub struct Consumer {
    id: ConsumerId,
    kind: ConsumerKind,
    state: Mutex<ConsumerState>,
    wake: Notify,
}

impl Consumer {
    fn new(id: ConsumerId, kind: ConsumerKind, channels: ChannelSet, cursor: u64) -> Self {
        Self {
            id,
            kind,
            state: Mutex::new(ConsumerState {
                channels,
                cursor,
                pending: Vec::new(),
                closed: None,
            }),
            wake: Notify::new(),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn kind(&self) -> ConsumerKind {
        self.kind
    }

    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    pub fn channels(&self) -> ChannelSet {
        self.state.lock().channels.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn closed(&self) -> Option<CloseReason> {
        self.state.lock().closed
    }

    fn offer(&self, notification: &Arc<Notification>, max_backlog: usize) -> Offer {
        let mut state = self.state.lock();
        if state.closed.is_some()
            || notification.id <= state.cursor
            || !state.channels.contains(&notification.channel)
        {
            return Offer::Skipped;
        }
        match state
            .pending
            .binary_search_by_key(&notification.id, |n| n.id)
        {
            Ok(_) => return Offer::Skipped,
            Err(pos) => state.pending.insert(pos, Arc::clone(notification)),
        }
        if state.pending.len() > max_backlog {
            Offer::Overflow
        } else {
            Offer::Queued
        }
    }

    /// Take everything pending and advance the cursor past it.
    pub fn take_pending(&self) -> Vec<Arc<Notification>> {
        let mut state = self.state.lock();
        if let Some(last) = state.pending.last() {
            state.cursor = last.id;
        }
        std::mem::take(&mut state.pending)
    }

    /// Raise the cursor. Pending entries at or below it are discarded. Never
    /// lowers the cursor, so nothing is delivered twice.
    pub fn advance_cursor(&self, to: u64) {
        let mut state = self.state.lock();
        if to > state.cursor {
            state.cursor = to;
            state.pending.retain(|n| n.id > to);
        }
    }

    /// Wait until there is something pending or the consumer is closed.
    pub async fn wait(&self) -> Delivery {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(reason) = state.closed {
                    return Delivery::Closed(reason);
                }
                if let Some(last) = state.pending.last() {
                    state.cursor = last.id;
                    return Delivery::Batch(std::mem::take(&mut state.pending));
                }
            }
            // notify_one stores a permit, so a wake sent between the check
            // above and this await is not lost.
            self.wake.notified().await;
        }
    }

    /// Mark closed and drop anything in flight.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
            state.pending.clear();
        }
        self.wake.notify_one();
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    consumers: HashMap<ConsumerId, Arc<Consumer>>,
    by_channel: HashMap<Channel, HashSet<ConsumerId>>,
}

#[derive(Debug)]
pub struct WaiterRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    max_backlog: usize,
}

impl WaiterRegistry {
    pub fn new(max_backlog: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            max_backlog,
        }
    }

    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }

    /// Register a consumer listening on `channels` from `cursor` onwards.
    pub fn register(
        self: &Arc<Self>,
        kind: ConsumerKind,
        channels: ChannelSet,
        cursor: u64,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(Consumer::new(id, kind, channels.clone(), cursor));
        {
            let mut inner = self.inner.lock();
            for channel in channels {
                inner.by_channel.entry(channel).or_default().insert(id);
            }
            inner.consumers.insert(id, Arc::clone(&consumer));
        }
        debug!(consumer_id = id, ?kind, cursor, "Consumer registered");
        Registration {
            consumer,
            registry: Arc::downgrade(self),
        }
    }

    /// Fan a freshly appended notification out to matching consumers.
    /// Returns how many consumers were woken.
    pub fn notify(&self, notification: &Arc<Notification>) -> usize {
        let targets: Vec<Arc<Consumer>> = {
            let inner = self.inner.lock();
            match inner.by_channel.get(&notification.channel) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| inner.consumers.get(id).cloned())
                    .collect(),
                None => return 0,
            }
        };

        let mut woken = 0;
        let mut overflowed = Vec::new();
        for consumer in &targets {
            match consumer.offer(notification, self.max_backlog) {
                Offer::Queued => {
                    consumer.wake.notify_one();
                    woken += 1;
                }
                Offer::Overflow => overflowed.push(Arc::clone(consumer)),
                Offer::Skipped => {}
            }
        }
        for consumer in overflowed {
            self.force_close(&consumer);
        }
        woken
    }

    /// Queue notifications read back from the store for one consumer. Used by
    /// sessions to catch up on entries published before they subscribed.
    /// The caller must keep publishing out while it reads and queues.
    pub fn backfill(&self, consumer: &Consumer, batch: &[Arc<Notification>]) -> usize {
        let mut queued = 0;
        for notification in batch {
            match consumer.offer(notification, self.max_backlog) {
                Offer::Queued => queued += 1,
                Offer::Overflow => {
                    self.force_close(consumer);
                    return queued;
                }
                Offer::Skipped => {}
            }
        }
        if queued > 0 {
            consumer.wake.notify_one();
        }
        queued
    }

    fn force_close(&self, consumer: &Consumer) {
        warn!(
            consumer_id = consumer.id,
            kind = ?consumer.kind,
            limit = self.max_backlog,
            "Consumer backlog exceeded, closing it"
        );
        consumer.close(CloseReason::BacklogExceeded);
        self.unregister(consumer.id);
    }

    /// Add a channel to a registered consumer. Returns false if the consumer
    /// is gone or already listened on the channel.
    pub fn subscribe(&self, id: ConsumerId, channel: Channel) -> bool {
        let mut inner = self.inner.lock();
        let Some(consumer) = inner.consumers.get(&id).cloned() else {
            return false;
        };
        if !consumer.state.lock().channels.insert(channel.clone()) {
            return false;
        }
        inner.by_channel.entry(channel).or_default().insert(id);
        true
    }

    /// Remove a channel from a registered consumer, dropping anything still
    /// pending for it. Returns false if nothing changed.
    pub fn unsubscribe(&self, id: ConsumerId, channel: &Channel) -> bool {
        let mut inner = self.inner.lock();
        let Some(consumer) = inner.consumers.get(&id).cloned() else {
            return false;
        };
        {
            let mut state = consumer.state.lock();
            if !state.channels.remove(channel) {
                return false;
            }
            state.pending.retain(|n| &n.channel != channel);
        }
        if let Some(ids) = inner.by_channel.get_mut(channel) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_channel.remove(channel);
            }
        }
        true
    }

    /// Remove a consumer from every index. Idempotent.
    pub fn unregister(&self, id: ConsumerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(consumer) = inner.consumers.remove(&id) else {
            return false;
        };
        let channels = consumer.channels();
        for channel in &channels {
            if let Some(ids) = inner.by_channel.get_mut(channel) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.by_channel.remove(channel);
                }
            }
        }
        debug!(consumer_id = id, kind = ?consumer.kind, "Consumer unregistered");
        true
    }

    /// Lowest cursor among registered long-poll waiters. The store must keep
    /// everything above it.
    pub fn min_waiter_cursor(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .consumers
            .values()
            .filter(|c| c.kind == ConsumerKind::Waiter)
            .map(|c| c.cursor())
            .min()
    }

    /// Close and drop every consumer.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let consumers: Vec<Arc<Consumer>> = {
            let mut inner = self.inner.lock();
            inner.by_channel.clear();
            inner.consumers.drain().map(|(_, c)| c).collect()
        };
        for consumer in &consumers {
            consumer.close(reason);
        }
        consumers.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers indexed under `channel`.
    pub fn listeners(&self, channel: &Channel) -> usize {
        self.inner
            .lock()
            .by_channel
            .get(channel)
            .map_or(0, HashSet::len)
    }
}

/// RAII handle that unregisters its consumer on drop.
#[derive(Debug)]
pub struct Registration {
    consumer: Arc<Consumer>,
    registry: Weak<WaiterRegistry>,
}

impl Registration {
    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }
}

impl Deref for Registration {
    type Target = Consumer;

    fn deref(&self) -> &Consumer {
        &self.consumer
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.consumer.id);
        }
    }
}
