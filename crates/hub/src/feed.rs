//! Live change feed for web clients.
//!
//! One store observer turns every telemetry, internal and config change into
//! a [`FeedEvent`] on a broadcast channel. A client reads [`snapshot`] once
//! and then follows the channel.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::{Store, Value};

/// Key sections (the segment after the device name) pushed to clients.
const FED_SECTIONS: [&str; 3] = ["telem", "int", "config"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEvent {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: serde_json::Value,
}

impl FeedEvent {
    pub fn new(key: &str, value: &Value) -> Self {
        Self {
            key: key.to_string(),
            kind: value.kind().name(),
            value: value.to_json(),
        }
    }
}

/// Whether changes to `key` belong on the feed.
pub fn is_fed(key: &str) -> bool {
    key.split('.')
        .nth(1)
        .is_some_and(|section| FED_SECTIONS.contains(&section))
}

/// Every fed entry currently in the store, sorted by key.
pub fn snapshot(store: &Store) -> Vec<FeedEvent> {
    store
        .snapshot("")
        .into_iter()
        .filter(|(key, _)| is_fed(key))
        .map(|(key, value)| FeedEvent::new(&key, &value))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
}

impl ChangeFeed {
    /// Register the feed observer on `store`. It stays registered for the
    /// life of the store.
    pub fn attach(store: &Store, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let tx = sender.clone();
        store.subscribe_prefix("", move |_, key, value| {
            if !is_fed(key) {
                return;
            }
            // Fails only while no client is connected.
            if tx.send(FeedEvent::new(key, value)).is_err() {
                trace!(key, "feed: no clients");
            }
        });
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStatus;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn fed_sections() {
        assert!(is_fed("pump.telem.value"));
        assert!(is_fed("system.int.flags.NoUpperForSwing"));
        assert!(is_fed("lamp.config.onTime"));

        assert!(!is_fed("pump.state.lastAction"));
        assert!(!is_fed("telem"));
        assert!(!is_fed("pump.telemetry.value"));
        assert!(!is_fed(""));
    }

    #[test]
    fn snapshot_keeps_fed_keys_only() {
        let store = Store::new();
        store.set("pump.telem.status", DeviceStatus::Working);
        store.set("pump.config.onTime", Duration::from_secs(15));
        store.set("pump.state.lastAction", 3_i64);
        store.set("system.int.deviceFlags", 0_u32);

        let snap = snapshot(&store);
        let keys: Vec<&str> = snap.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            keys,
            ["pump.config.onTime", "pump.telem.status", "system.int.deviceFlags"]
        );
        assert_eq!(snap[0].kind, "duration");
        assert_eq!(snap[0].value, 15);
        assert_eq!(snap[1].value, "Working");
    }

    #[test]
    fn store_changes_reach_subscribers() {
        let store = Store::new();
        let feed = ChangeFeed::attach(&store, 16);
        let mut rx = feed.subscribe();

        store.set("pump.telem.value", true);
        store.set("pump.state.lastAction", 1_i64);
        store.set("pump.telem.value", true);
        store.set("lamp.config.enabled", false);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.key, "pump.telem.value");
        assert_eq!(first.kind, "bool");
        assert_eq!(first.value, true);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.key, "lamp.config.enabled");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn changes_without_clients_are_dropped() {
        let store = Store::new();
        let feed = ChangeFeed::attach(&store, 4);
        store.set("pump.telem.value", true);

        let mut rx = feed.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
