//! Subscription records and the thread-safe registry that owns them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One logical upstream subscription.
///
/// `id` is an opaque correlation value (usually the request time in ms) that
/// only the upstream protocol interprets. It is replayed unchanged when the
/// subscription is re-sent after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub from: String,
    pub to: String,
    #[serde(skip)]
    id: i64,
}

impl Subscription {
    pub fn new(from: &str, to: &str, id: i64) -> Self {
        Self {
            from: from.to_uppercase(),
            to: to.to_uppercase(),
            id,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Channel name -> subscription, safe to share between tasks.
///
/// The channel name is derived from the pair by the upstream protocol, so a
/// registry never holds two entries for the same normalized pair.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription unless the channel is already tracked.
    ///
    /// Returns `false` (and keeps the existing entry and its id) on a duplicate.
    pub fn insert(&self, channel: &str, subscription: Subscription) -> bool {
        match self.entries.entry(channel.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(subscription);
                true
            }
        }
    }

    pub fn remove(&self, channel: &str) -> Option<Subscription> {
        self.entries.remove(channel).map(|(_, sub)| sub)
    }

    pub fn get(&self, channel: &str) -> Option<Subscription> {
        self.entries.get(channel).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.entries.contains_key(channel)
    }

    /// Resolve the pair a channel name was registered for.
    pub fn pair_for_channel(&self, channel: &str) -> Option<(String, String)> {
        self.entries
            .get(channel)
            .map(|entry| (entry.from.clone(), entry.to.clone()))
    }

    /// Point-in-time copy; later changes do not affect it.
    pub fn snapshot(&self) -> HashMap<String, Subscription> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_subscription_normalizes_symbols() {
        let sub = Subscription::new("btc", "usd", 42);
        assert_eq!(sub.from, "BTC");
        assert_eq!(sub.to, "USD");
        assert_eq!(sub.id(), 42);
    }

    #[test]
    fn test_registry_rejects_duplicate_channel() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.insert("BTC/USD", Subscription::new("BTC", "USD", 1)));
        assert!(!registry.insert("BTC/USD", Subscription::new("BTC", "USD", 2)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("BTC/USD").map(|s| s.id()), Some(1));
    }

    #[test]
    fn test_registry_remove_and_lookup() {
        let registry = SubscriptionRegistry::new();
        registry.insert("eth-usd", Subscription::new("eth", "usd", 5));

        assert_eq!(
            registry.pair_for_channel("eth-usd"),
            Some(("ETH".to_string(), "USD".to_string()))
        );
        assert_eq!(registry.pair_for_channel("missing"), None);

        assert!(registry.remove("eth-usd").is_some());
        assert!(registry.remove("eth-usd").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = SubscriptionRegistry::new();
        registry.insert("a", Subscription::new("A", "B", 1));
        let snapshot = registry.snapshot();
        registry.insert("c", Subscription::new("C", "D", 2));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_inserts_keep_one_entry_per_channel() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.insert("BTC:USD", Subscription::new("BTC", "USD", i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
    }
}
