//! A named queue connection: producer, subscriptions, consumer loop and
//! delay reaper over one store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relq_core::{FailureHook, HandlerResult, QueueKeys, RetryDecider};

use crate::config::ConnectionOptions;
use crate::consumer::handler::{FnHandler, Handler, TypedHandler};
use crate::consumer::registry::{Subscription, SubscriptionRegistry};
use crate::consumer::{ConsumerLoop, ConsumerState, ConsumerStats, POLL_TIMEOUT};
use crate::error::{QueueError, QueueResult};
use crate::producer::Producer;
use crate::reaper::{DelayReaper, REAP_INTERVAL, ReaperHandle};
use crate::store::QueueStore;

/// Wait between `close()` and closing the store: longer than one poll, so
/// an outstanding pop returns before the transport goes away.
pub const CLOSE_GRACE: Duration = POLL_TIMEOUT.saturating_add(Duration::from_millis(10));

/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    producer: Producer,
    registry: Arc<SubscriptionRegistry>,
    consumer: Arc<ConsumerLoop>,
    reaper: Mutex<Option<ReaperHandle>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("prefix", &self.inner.keys.prefix())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    /// Wrap an open store. Starts the keepalive task when `options.ping` is
    /// set, so this must run inside a tokio runtime.
    pub fn new(name: impl Into<String>, store: Arc<dyn QueueStore>, options: &ConnectionOptions) -> Self {
        let name = name.into();
        let keys = QueueKeys::new(options.prefix.clone());
        let registry = Arc::new(SubscriptionRegistry::new());
        let consumer = ConsumerLoop::new(
            name.clone(),
            store.clone(),
            keys.clone(),
            registry.clone(),
            RetryDecider::new(options.max_attempts),
        )
        .with_retry_seconds(options.retry_seconds);

        let keepalive = options
            .keepalive()
            .map(|every| spawn_keepalive(name.clone(), store.clone(), every));

        info!(connection = %name, prefix = %keys.prefix(), "queue connection opened");

        Self {
            inner: Arc::new(Inner {
                producer: Producer::new(store.clone(), keys.clone()),
                name,
                store,
                keys,
                registry,
                consumer: Arc::new(consumer),
                reaper: Mutex::new(None),
                keepalive: Mutex::new(keepalive),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.inner.keys
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Enqueue `data` on `queue` for immediate delivery.
    pub async fn send<T>(&self, queue: &str, data: &T) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        self.inner.producer.send(queue, data).await
    }

    /// Enqueue `data` on `queue`, delivered no earlier than `delay` from now.
    pub async fn send_with_delay<T>(&self, queue: &str, data: &T, delay: Duration) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        self.inner.producer.send_with_delay(queue, data, delay).await
    }

    /// Consume `queue` with an async closure over the raw JSON payload.
    pub fn subscribe<F, Fut>(&self, queue: &str, handler: F) -> QueueResult<()>
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(queue, FnHandler(handler), None)
    }

    /// Consume `queue` with an async closure over a typed payload.
    pub fn subscribe_typed<T, F, Fut>(&self, queue: &str, handler: F) -> QueueResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_handler(queue, TypedHandler::new(handler), None)
    }

    /// Consume `queue` with any [`Handler`], optionally transforming failed
    /// packages through `on_failure` before they are retried.
    ///
    /// Replaces an existing subscription for the same queue. The first
    /// subscription starts the consumer loop and the delay reaper.
    pub fn subscribe_handler<H>(&self, queue: &str, handler: H, on_failure: Option<FailureHook>) -> QueueResult<()>
    where
        H: Handler,
    {
        self.ensure_open()?;

        let key = self.inner.keys.waiting(queue);
        self.inner.registry.insert(
            key.clone(),
            Subscription {
                queue: queue.to_string(),
                handler: Arc::new(handler),
                on_failure,
            },
        );
        // Lost a race with close(); it may already have cleared the registry.
        if self.is_closed() {
            self.inner.registry.remove(&key);
            return Err(QueueError::Closed(self.inner.name.clone()));
        }
        debug!(connection = %self.inner.name, queue = %queue, "subscribed");

        self.start_reaper();
        self.inner.consumer.ensure_running();
        Ok(())
    }

    /// Stop consuming `queue` from the next poll on. Returns whether a
    /// subscription existed.
    pub fn unsubscribe(&self, queue: &str) -> bool {
        let removed = self.inner.registry.remove(&self.inner.keys.waiting(queue));
        if removed {
            debug!(connection = %self.inner.name, queue = %queue, "unsubscribed");
        }
        removed
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.queues()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.inner.consumer.state()
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        self.inner.consumer.stats()
    }

    /// A reaper over this connection's store, for ticking by hand.
    pub fn delay_reaper(&self) -> DelayReaper {
        DelayReaper::new(self.inner.store.clone(), self.inner.keys.clone())
    }

    fn start_reaper(&self) {
        let mut slot = lock(&self.inner.reaper);
        if slot.as_ref().is_some_and(|running| !running.is_finished()) {
            return;
        }
        *slot = Some(self.delay_reaper().spawn(REAP_INTERVAL));
    }

    /// Stop the reaper and keepalive, drop every subscription and close the
    /// store after [`CLOSE_GRACE`], once the consumer loop has finished the
    /// package it is handling.
    ///
    /// Returns the task doing the deferred close, or `None` when the
    /// connection was already closed.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return None;
        }

        let reaper = lock(&self.inner.reaper).take().map(ReaperHandle::stop);
        if let Some(keepalive) = lock(&self.inner.keepalive).take() {
            keepalive.abort();
        }
        self.inner.registry.clear();
        let consumer = self.inner.consumer.take_task();
        info!(connection = %self.inner.name, "closing queue connection");

        let store = self.inner.store.clone();
        let name = self.inner.name.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            // The loop exits after its last poll and any dispatch still
            // running; its retry or dead-letter write needs the store open.
            if let Some(consumer) = consumer {
                if let Err(err) = consumer.await {
                    warn!(connection = %name, error = %err, "consumer loop ended abnormally");
                }
            }
            if let Some(reaper) = reaper {
                if let Err(err) = reaper.await {
                    warn!(connection = %name, error = %err, "delay reaper ended abnormally");
                }
            }
            store.close().await;
            info!(connection = %name, "queue connection closed");
        }))
    }
}

fn spawn_keepalive(name: String, store: Arc<dyn QueueStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the connection was just opened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = store.ping().await {
                warn!(connection = %name, error = %err, "keepalive ping failed");
            }
        }
    })
}
