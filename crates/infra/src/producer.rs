//! Producer: enqueue packages now or after a delay.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use relq_core::{Package, QueueKeys};

use crate::error::{QueueError, QueueResult};
use crate::store::QueueStore;

/// Writes new packages to a store.
///
/// A failed write is surfaced to the caller and never retried here.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
}

impl Producer {
    pub fn new(store: Arc<dyn QueueStore>, keys: QueueKeys) -> Self {
        Self { store, keys }
    }

    /// Enqueue `data` on `queue` for immediate delivery.
    pub async fn send<T>(&self, queue: &str, data: &T) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_delay(queue, data, Duration::ZERO).await
    }

    /// Enqueue `data` on `queue`, delivered no earlier than `delay` from now.
    ///
    /// Delays are whole seconds; a zero delay pushes straight onto the
    /// waiting list.
    pub async fn send_with_delay<T>(&self, queue: &str, data: &T, delay: Duration) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data).map_err(relq_core::CodecError::Encode)?;
        let package = Package::new(queue, data, delay.as_secs());
        self.enqueue(&package).await
    }

    /// Write an already-built package according to its `delay`.
    #[instrument(skip(self, package), fields(queue = %package.queue, package_id = %package.id), err)]
    pub async fn enqueue(&self, package: &Package) -> QueueResult<()> {
        let raw = package.encode()?;

        let (key, written) = if package.delay > 0 {
            let due = package.time.saturating_add_unsigned(package.delay);
            let key = self.keys.delayed();
            (key.to_string(), self.store.zadd(key, due, &raw).await?)
        } else {
            let key = self.keys.waiting(&package.queue);
            let written = self.store.lpush(&key, &raw).await?;
            (key, written)
        };

        if written == 0 {
            return Err(QueueError::NotAcknowledged { key });
        }

        debug!(key = %key, delay = package.delay, "package enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn producer() -> (Arc<InMemoryStore>, Producer) {
        let store = InMemoryStore::arc();
        let producer = Producer::new(store.clone(), QueueKeys::default());
        (store, producer)
    }

    #[tokio::test]
    async fn immediate_send_lands_on_the_waiting_list() {
        let (store, producer) = producer();
        producer
            .send("emails", &json!({"to": "a@example.com"}))
            .await
            .unwrap();

        let waiting = store.list("{redis-queue}-waitingemails");
        assert_eq!(waiting.len(), 1);
        let package = Package::decode(&waiting[0]).unwrap();
        assert_eq!(package.queue, "emails");
        assert_eq!(package.attempts, 0);
        assert_eq!(package.data, json!({"to": "a@example.com"}));
    }

    #[tokio::test]
    async fn delayed_send_is_scored_by_due_time() {
        let (store, producer) = producer();
        producer
            .send_with_delay("jobs", &json!({"n": 1}), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(store.list("{redis-queue}-waitingjobs").is_empty());
        let delayed = store.sorted_set("{redis-queue}-delayed");
        assert_eq!(delayed.len(), 1);

        let (raw, score) = &delayed[0];
        let package = Package::decode(raw).unwrap();
        assert_eq!(package.delay, 5);
        assert_eq!(*score, package.time + 5);
    }

    #[tokio::test]
    async fn typed_payloads_are_serialized() {
        #[derive(Serialize)]
        struct Email<'a> {
            to: &'a str,
        }

        let (store, producer) = producer();
        producer.send("emails", &Email { to: "b@example.com" }).await.unwrap();

        let raw = &store.list("{redis-queue}-waitingemails")[0];
        assert_eq!(Package::decode(raw).unwrap().data["to"], "b@example.com");
    }

    #[tokio::test]
    async fn store_failures_surface_to_the_caller() {
        let (store, producer) = producer();
        store.close().await;

        let err = producer.send("emails", &json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
    }

    #[tokio::test]
    async fn unacknowledged_delayed_write_is_an_error() {
        let (_store, producer) = producer();
        let package = Package::new("jobs", json!({"n": 1}), 10);

        producer.enqueue(&package).await.unwrap();
        let err = producer.enqueue(&package).await.unwrap_err();
        assert!(matches!(err, QueueError::NotAcknowledged { .. }));
    }
}
