//! Offline store-and-forward MESSAGE queue.
//!
//! Grounded on the `messages` class in `original_source/server/server.h`:
//! a SIP MESSAGE addressed to a userid with no active target is queued
//! here instead of being dropped, and flushed the next time that userid
//! registers or published a contact. Entries that outlive their own TTL
//! are dropped by [`MessageStore::sweep_expired`], called from the same
//! background pass that expires registry entries.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub body: String,
    pub content_type: String,
    pub received: i64,
    pub expires: i64,
}

/// Per-user queue of pending messages, keyed by recipient userid.
pub struct MessageStore {
    queues: Mutex<std::collections::HashMap<String, Vec<Message>>>,
    ttl_s: i64,
}

impl MessageStore {
    pub fn new(ttl_s: i64) -> Self {
        Self {
            queues: Mutex::new(std::collections::HashMap::new()),
            ttl_s,
        }
    }

    /// Queue `body` for `to`, stamped with this store's TTL.
    pub fn publish(&self, from: &str, to: &str, body: &str, content_type: &str) {
        let msg = Message {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            content_type: content_type.to_string(),
            received: now(),
            expires: now() + self.ttl_s,
        };
        self.queues
            .lock()
            .expect("message store mutex poisoned")
            .entry(to.to_string())
            .or_default()
            .push(msg);
    }

    /// Drain and return every message queued for `to`, e.g. on
    /// registration or an explicit `pbxctl message` flush.
    pub fn drain(&self, to: &str) -> Vec<Message> {
        self.queues
            .lock()
            .expect("message store mutex poisoned")
            .remove(to)
            .unwrap_or_default()
    }

    pub fn pending_count(&self, to: &str) -> usize {
        self.queues
            .lock()
            .expect("message store mutex poisoned")
            .get(to)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues
            .lock()
            .expect("message store mutex poisoned")
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// Drop expired messages across all queues, returning how many were
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        let deadline = now();
        let mut queues = self.queues.lock().expect("message store mutex poisoned");
        let mut removed = 0;
        queues.retain(|_, msgs| {
            let before = msgs.len();
            msgs.retain(|m| m.expires > deadline);
            removed += before - msgs.len();
            !msgs.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_drain_returns_in_order() {
        let store = MessageStore::new(3600);
        store.publish("100", "101", "hello", "text/plain");
        store.publish("102", "101", "again", "text/plain");
        let drained = store.drain("101");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, "hello");
        assert_eq!(store.pending_count("101"), 0);
    }

    #[test]
    fn drain_is_destructive() {
        let store = MessageStore::new(3600);
        store.publish("100", "101", "hello", "text/plain");
        store.drain("101");
        assert!(store.drain("101").is_empty());
    }

    #[test]
    fn sweep_expired_removes_only_stale_entries() {
        let store = MessageStore::new(-1);
        store.publish("100", "101", "stale", "text/plain");
        let removed = store.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.total_pending(), 0);
    }
}
