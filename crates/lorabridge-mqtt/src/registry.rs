//! Subscription registry owned by the broker client
//!
//! Maps topic filters to the channel feeding their handler. Read in full on
//! reconnect to replay subscriptions.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::transport::BrokerMessage;

/// Sender half feeding a subscription handler
pub type Handler = mpsc::Sender<BrokerMessage>;

/// Topic filter to handler mapping
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<String, Handler>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for a topic filter
    ///
    /// Returns true if an existing handler was replaced.
    pub fn insert(&self, topic: impl Into<String>, handler: Handler) -> bool {
        self.entries.write().insert(topic.into(), handler).is_some()
    }

    /// Remove a topic filter
    pub fn remove(&self, topic: &str) -> Option<Handler> {
        self.entries.write().remove(topic)
    }

    /// Handlers whose filter matches a concrete topic
    pub fn handlers_for(&self, topic: &str) -> Vec<Handler> {
        self.entries
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    /// Registered topic filters
    pub fn topics(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered filters
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry, closing the handler channels
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// MQTT topic filter matching (`+` one level, trailing `#` the remainder)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        let filter = "v3/app@ttn/devices/+/up";
        assert!(topic_matches(filter, "v3/app@ttn/devices/dev-1/up"));
        assert!(!topic_matches(filter, "v3/app@ttn/devices/dev-1/down/sent"));
        assert!(!topic_matches(filter, "v3/app@ttn/devices/up"));

        assert!(topic_matches("v3/#", "v3/app@ttn/devices/dev-1/up"));
        assert!(topic_matches("v3/#", "v3"));
        assert!(topic_matches("uplinks", "uplinks"));
        assert!(!topic_matches("uplinks", "uplinks/extra"));
    }

    #[test]
    fn test_insert_replaces() {
        let registry = SubscriptionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        assert!(!registry.insert("a/+", tx1));
        assert!(registry.insert("a/+", tx2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.handlers_for("a/b").len(), 1);
        assert!(registry.handlers_for("b/a").is_empty());
    }

    #[tokio::test]
    async fn test_clear_closes_channels() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.insert("a", tx);

        registry.clear();

        assert!(registry.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
