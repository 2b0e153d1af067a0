//! Append-only notification log.
//!
//! Sequence ids are assigned under the log write lock, so the log is always
//! sorted by id and readers can binary-search their starting point.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetentionConfig;
use crate::model::{Channel, ChannelSet, Notification};

#[derive(Debug)]
pub struct NotificationStore {
    log: RwLock<VecDeque<Arc<Notification>>>,
    // Last assigned id; 0 means nothing was ever published.
    last_id: AtomicU64,
    retention: RetentionConfig,
}

impl NotificationStore {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            log: RwLock::new(VecDeque::new()),
            last_id: AtomicU64::new(0),
            retention,
        }
    }

    /// Append a notification and return it with its assigned id.
    pub fn append(&self, channel: Channel, message: Value) -> Arc<Notification> {
        let mut log = self.log.write();
        let id = self.last_id.load(Ordering::Relaxed) + 1;
        let notification = Arc::new(Notification {
            id,
            channel,
            message,
            created_at: Utc::now(),
        });
        log.push_back(Arc::clone(&notification));
        self.last_id.store(id, Ordering::Release);
        notification
    }

    /// All retained notifications after `last_seen_id` on any of `channels`,
    /// in ascending id order.
    pub fn read_since(&self, channels: &ChannelSet, last_seen_id: u64) -> Vec<Arc<Notification>> {
        if channels.is_empty() || last_seen_id >= self.last_id() {
            return Vec::new();
        }
        let log = self.log.read();
        let start = log.partition_point(|n| n.id <= last_seen_id);
        log.range(start..)
            .filter(|n| channels.contains(&n.channel))
            .cloned()
            .collect()
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    /// Id of the oldest retained notification, if any.
    pub fn oldest_id(&self) -> Option<u64> {
        self.log.read().front().map(|n| n.id)
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Whether notifications after `last_seen_id` have already been trimmed,
    /// meaning a reader resuming from there only gets the retained tail.
    pub fn is_truncated(&self, last_seen_id: u64) -> bool {
        let log = self.log.read();
        match log.front() {
            Some(oldest) => oldest.id > last_seen_id.saturating_add(1),
            None => self.last_id() > last_seen_id,
        }
    }

    /// Cursor to resume a reader from. A cursor ahead of the log comes from a
    /// client that saw a previous process; it restarts from the beginning so
    /// new ids are not skipped.
    pub fn resume_point(&self, last_seen_id: u64) -> u64 {
        let last_id = self.last_id();
        if last_seen_id > last_id {
            warn!(last_seen_id, last_id, "Cursor is ahead of the log, resetting it");
            0
        } else {
            last_seen_id
        }
    }

    /// Apply the retention policy. Entries with an id above `floor` are never
    /// removed. Returns the number of entries dropped.
    pub fn trim(&self, now: DateTime<Utc>, floor: Option<u64>) -> usize {
        let max_age = self.retention.max_age();
        let mut log = self.log.write();
        let mut removed = 0;
        while log.len() > self.retention.min_retained {
            let Some(oldest) = log.front() else { break };
            if floor.is_some_and(|floor| oldest.id > floor) {
                break;
            }
            let over_cap = log.len() > self.retention.max_retained;
            let age = now
                .signed_duration_since(oldest.created_at)
                .to_std()
                .unwrap_or_default();
            let expired = age > max_age;
            if !over_cap && !expired {
                break;
            }
            log.pop_front();
            removed += 1;
        }
        if removed > 0 {
            debug!(
                removed,
                retained = log.len(),
                oldest = log.front().map(|n| n.id),
                "Trimmed notification log"
            );
        }
        removed
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ch(name: &str) -> Channel {
        Channel::new(name).unwrap()
    }

    fn set(names: &[&str]) -> ChannelSet {
        names.iter().map(|n| ch(n)).collect()
    }

    fn small_store(min: usize, max: usize, max_age_secs: u64) -> NotificationStore {
        NotificationStore::new(RetentionConfig {
            min_retained: min,
            max_retained: max,
            max_age_secs,
        })
    }

    #[test]
    fn test_ids_increase_in_publish_order() {
        let store = NotificationStore::default();
        let ids: Vec<u64> = (0..5)
            .map(|i| store.append(ch("c"), json!(i)).id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let read: Vec<u64> = store.read_since(&set(&["c"]), 0).iter().map(|n| n.id).collect();
        assert_eq!(read, ids);
    }

    #[test]
    fn test_read_since_filters_channels() {
        let store = NotificationStore::default();
        store.append(ch("c1"), json!("m1"));
        store.append(ch("c2"), json!("m2"));
        store.append(ch("c3"), json!("m3"));

        let read = store.read_since(&set(&["c1", "c3"]), 0);
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].channel, ch("c1"));
        assert_eq!(read[1].message, json!("m3"));

        assert_eq!(store.read_since(&set(&["c1", "c3"]), 1).len(), 1);
        assert!(store.read_since(&set(&["c1"]), 3).is_empty());
    }

    #[test]
    fn test_empty_channel_set_reads_nothing() {
        let store = NotificationStore::default();
        store.append(ch("c1"), json!(1));
        assert!(store.read_since(&ChannelSet::new(), 0).is_empty());
    }

    #[test]
    fn test_trim_keeps_min_retained_regardless_of_age() {
        let store = small_store(3, 100, 0);
        for i in 0..10 {
            store.append(ch("c"), json!(i));
        }
        let later = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.trim(later, None), 7);
        assert_eq!(store.len(), 3);
        assert_eq!(store.oldest_id(), Some(8));
    }

    #[test]
    fn test_trim_skips_fresh_entries_below_cap() {
        let store = small_store(2, 100, 3600);
        for i in 0..10 {
            store.append(ch("c"), json!(i));
        }
        assert_eq!(store.trim(Utc::now(), None), 0);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn test_trim_enforces_hard_cap() {
        let store = small_store(2, 4, 3600);
        for i in 0..10 {
            store.append(ch("c"), json!(i));
        }
        assert_eq!(store.trim(Utc::now(), None), 6);
        assert_eq!(store.oldest_id(), Some(7));
    }

    #[test]
    fn test_trim_respects_floor() {
        let store = small_store(1, 2, 0);
        for i in 0..10 {
            store.append(ch("c"), json!(i));
        }
        let later = Utc::now() + chrono::Duration::seconds(5);
        store.trim(later, Some(4));
        // Ids above the floor stay so a waiter at cursor 4 misses nothing.
        assert_eq!(store.oldest_id(), Some(5));
        assert_eq!(store.read_since(&set(&["c"]), 4).len(), 6);
    }

    #[test]
    fn test_old_cursor_gets_retained_tail() {
        let store = small_store(3, 3, 3600);
        for i in 0..10 {
            store.append(ch("c"), json!(i));
        }
        store.trim(Utc::now(), None);

        assert!(store.is_truncated(0));
        assert!(!store.is_truncated(7));
        let tail: Vec<u64> = store.read_since(&set(&["c"]), 0).iter().map(|n| n.id).collect();
        assert_eq!(tail, vec![8, 9, 10]);
    }

    #[test]
    fn test_is_truncated_handles_max_cursor() {
        let store = NotificationStore::default();
        store.append(ch("c"), json!(1));
        assert!(!store.is_truncated(u64::MAX));
    }

    #[test]
    fn test_resume_point_resets_cursor_ahead_of_log() {
        let store = NotificationStore::default();
        assert_eq!(store.resume_point(0), 0);
        store.append(ch("c"), json!(1));
        store.append(ch("c"), json!(2));
        assert_eq!(store.resume_point(1), 1);
        assert_eq!(store.resume_point(2), 2);
        assert_eq!(store.resume_point(500), 0);
        assert_eq!(store.resume_point(u64::MAX), 0);
    }
}
