//! Last-known-good mirror of the node, published copy-on-write.
//!
//! The scheduler clones the current [`StateSnapshot`], applies one tick's results to
//! the copy and publishes it in one step through a `watch` channel. Readers hold an
//! `Arc` to whichever version they received and never see a half-applied tick.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::model::{Contact, Message, NodeInfo, RepeaterStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub node_info: NodeInfo,
    /// Keyed by public key, or by name for contacts without one.
    pub contacts: BTreeMap<String, Contact>,
    /// Most recent messages, oldest first.
    pub messages: VecDeque<Message>,
    pub repeater_stats: BTreeMap<String, RepeaterStats>,
    /// Newest message timestamp per conversation (`channel_<idx>` or sender key prefix).
    pub last_message_at: BTreeMap<String, u64>,
    /// When any refresh kind last succeeded. Staleness is derived from this.
    pub last_successful_refresh_at: Option<u64>,
    /// False until real device data has been merged in.
    pub has_data: bool,
}

impl StateSnapshot {
    /// Minimal snapshot used before any device data exists.
    pub fn placeholder() -> Self {
        Self {
            node_info: NodeInfo::placeholder(),
            contacts: BTreeMap::new(),
            messages: VecDeque::new(),
            repeater_stats: BTreeMap::new(),
            last_message_at: BTreeMap::new(),
            last_successful_refresh_at: None,
            has_data: false,
        }
    }

    /// Append a message, evicting the oldest beyond `capacity`, and advance the
    /// conversation's last-message timestamp.
    pub fn push_message(&mut self, message: Message, capacity: usize) {
        let key = message.conversation().to_string();
        let stamp = self.last_message_at.entry(key).or_insert(0);
        *stamp = (*stamp).max(message.timestamp);
        self.messages.push_back(message);
        while self.messages.len() > capacity {
            self.messages.pop_front();
        }
    }

    /// Replace the contact table, returning contacts not present in the previous one.
    pub fn replace_contacts(&mut self, contacts: BTreeMap<String, Contact>) -> Vec<Contact> {
        let discovered = contacts
            .values()
            .filter(|c| !self.contacts.values().any(|old| old.same_identity(c)))
            .cloned()
            .collect();
        self.contacts = contacts;
        discovered
    }

    pub fn contact_by_name(&self, name: &str) -> Option<&Contact> {
        self.contacts.values().find(|c| c.advertised_name == name)
    }

    /// Contact whose public key starts with `prefix` (hex, case-insensitive).
    pub fn contact_by_key_prefix(&self, prefix: &str) -> Option<&Contact> {
        self.contacts.values().find(|c| c.key_starts_with(prefix))
    }

    /// Seconds since the last successful refresh, or `None` if there never was one.
    pub fn age(&self, now: u64) -> Option<u64> {
        self.last_successful_refresh_at
            .map(|at| now.saturating_sub(at))
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::placeholder()
    }
}

/// Holder of the published snapshot.
pub struct SnapshotCache {
    tx: watch::Sender<Arc<StateSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(StateSnapshot::placeholder()));
        Self { tx }
    }

    pub fn current(&self) -> Arc<StateSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.tx.subscribe()
    }

    /// Swap in a new snapshot. Works with or without subscribers.
    pub fn publish(&self, snapshot: StateSnapshot) -> Arc<StateSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, MessageKind, NodeType};

    fn channel_msg(text: &str, ts: u64) -> Message {
        Message {
            text: text.to_string(),
            direction: Direction::Incoming,
            kind: MessageKind::Channel { index: 0 },
            timestamp: ts,
        }
    }

    fn contact(name: &str, key: Option<&str>) -> Contact {
        Contact {
            advertised_name: name.to_string(),
            public_key: key.map(str::to_string),
            node_type: NodeType::Client,
            last_advert_at: 0,
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn backlog_is_bounded_oldest_first() {
        let mut snap = StateSnapshot::placeholder();
        for i in 0..5 {
            snap.push_message(channel_msg(&format!("m{}", i), 100 + i), 3);
        }
        let texts: Vec<_> = snap.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(snap.last_message_at["channel_0"], 104);
    }

    #[test]
    fn replace_contacts_reports_only_new_identities() {
        let mut snap = StateSnapshot::placeholder();
        let mut first = BTreeMap::new();
        first.insert("ab12".to_string(), contact("Alice", Some("ab12")));
        assert_eq!(snap.replace_contacts(first.clone()).len(), 1);

        let mut second = first;
        // Renamed but same key: not new.
        second.insert("ab12".to_string(), contact("Alice2", Some("ab12")));
        second.insert("Bob".to_string(), contact("Bob", None));
        let new = snap.replace_contacts(second);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].advertised_name, "Bob");
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe();
        assert!(!cache.current().has_data);

        let mut next = StateSnapshot::placeholder();
        next.has_data = true;
        cache.publish(next);

        rx.changed().await.unwrap();
        assert!(rx.borrow().has_data);
        assert!(cache.current().has_data);
    }
}
