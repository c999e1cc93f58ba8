//! Subscription registry: waiting-list key → handler.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use relq_core::FailureHook;

use super::handler::Handler;

/// One queue subscription held by a connection.
#[derive(Clone)]
pub struct Subscription {
    pub queue: String,
    pub handler: Arc<dyn Handler>,
    pub on_failure: Option<FailureHook>,
}

/// Queue subscriptions of one connection, keyed by waiting-list key.
///
/// Safe to mutate while a poll is outstanding: the consumer loop takes a
/// snapshot of the keys per poll, so changes apply from the next poll on.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<BTreeMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or replace) the subscription for `key`.
    pub fn insert(&self, key: String, subscription: Subscription) {
        self.write().insert(key, subscription);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<Subscription> {
        self.read().get(key).cloned()
    }

    /// Waiting-list keys to poll, in a stable order.
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn queues(&self) -> Vec<String> {
        self.read().values().map(|s| s.queue.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler::FnHandler;
    use serde_json::Value as JsonValue;

    fn subscription(queue: &str) -> Subscription {
        Subscription {
            queue: queue.to_string(),
            handler: Arc::new(FnHandler(|_: JsonValue| async { Ok(()) })),
            on_failure: None,
        }
    }

    #[test]
    fn insert_replace_and_remove() {
        let registry = SubscriptionRegistry::new();
        registry.insert("k-b".into(), subscription("b"));
        registry.insert("k-a".into(), subscription("a"));
        registry.insert("k-a".into(), subscription("a2"));

        assert_eq!(registry.keys(), vec!["k-a".to_string(), "k-b".to_string()]);
        assert_eq!(registry.get("k-a").unwrap().queue, "a2");

        assert!(registry.remove("k-a"));
        assert!(!registry.remove("k-a"));
        assert!(registry.get("k-a").is_none());
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = SubscriptionRegistry::new();
        registry.insert("k".into(), subscription("q"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.keys().is_empty());
    }
}
