//! Consumer loop: blocking pop across subscribed queues and dispatch to
//! handlers.
//!
//! One loop task runs per connection while it has subscriptions. Each
//! cycle snapshots the subscribed waiting-list keys, issues a single
//! bounded `BRPOP` and dispatches any received item before polling again,
//! so a connection runs at most one handler at a time. The in-flight flag
//! is released as soon as the pop returns.

pub mod handler;
pub mod registry;

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relq_core::{Disposition, FailureHook, HandlerError, HandlerResult, Package, QueueKeys, RetryDecider};

use crate::error::{QueueError, QueueResult};
use crate::store::QueueStore;

use self::handler::Handler;
use self::registry::SubscriptionRegistry;

/// Store-side wait of one blocking pop.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Where the consumer loop of a connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Polling,
    Dispatching,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Dispatching,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Polling => 1,
            Self::Dispatching => 2,
        }
    }
}

/// Counters since the loop was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub corrupt: u64,
    pub returned: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    corrupt: AtomicU64,
    returned: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
        }
    }
}

/// Releases the in-flight flag when the pop returns or is dropped.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ConsumerLoop {
    connection: String,
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    registry: Arc<SubscriptionRegistry>,
    decider: RetryDecider,
    retry_seconds: u64,
    in_flight: AtomicBool,
    running: AtomicBool,
    state: AtomicU8,
    counters: Counters,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerLoop {
    pub fn new(
        connection: impl Into<String>,
        store: Arc<dyn QueueStore>,
        keys: QueueKeys,
        registry: Arc<SubscriptionRegistry>,
        decider: RetryDecider,
    ) -> Self {
        Self {
            connection: connection.into(),
            store,
            keys,
            registry,
            decider,
            retry_seconds: 0,
            in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            state: AtomicU8::new(ConsumerState::Idle.as_u8()),
            counters: Counters::default(),
            task: Mutex::new(None),
        }
    }

    /// Schedule retries through the delayed set, `retry_seconds * attempts`
    /// from now. Zero pushes retries straight back to the waiting list.
    pub fn with_retry_seconds(mut self, retry_seconds: u64) -> Self {
        self.retry_seconds = retry_seconds;
        self
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Start the loop task unless it is already running or there is nothing
    /// to poll. Must be called from within a tokio runtime.
    pub fn ensure_running(self: &Arc<Self>) {
        if self.registry.is_empty() {
            return;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run().await });
        *self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    /// Take the handle of the most recently started loop task.
    ///
    /// Once subscriptions are cleared the task ends after its current poll
    /// and dispatch, so awaiting it waits out any package still in a handler.
    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn run(self: Arc<Self>) {
        info!(connection = %self.connection, "consumer loop started");

        loop {
            let keys = self.registry.keys();
            if keys.is_empty() {
                self.set_state(ConsumerState::Idle);
                self.running.store(false, Ordering::Release);
                // A subscribe racing with this exit may have seen `running`
                // still set; pick its work up instead of leaving it idle.
                if self.registry.is_empty() || self.running.swap(true, Ordering::AcqRel) {
                    break;
                }
                continue;
            }

            self.set_state(ConsumerState::Polling);
            match self.poll(&keys).await {
                Ok(Some((key, raw))) => {
                    self.set_state(ConsumerState::Dispatching);
                    self.dispatch(&key, raw).await;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(connection = %self.connection, error = %err, "poll failed");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }

        info!(connection = %self.connection, "consumer loop idle");
    }

    /// Issue one blocking pop across `keys`.
    ///
    /// Fails with [`QueueError::PollInFlight`] rather than issuing a second
    /// pop while one is outstanding on this connection.
    pub async fn poll(&self, keys: &[String]) -> QueueResult<Option<(String, String)>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(QueueError::PollInFlight);
        }
        let _guard = PollGuard(&self.in_flight);

        Ok(self.store.brpop(keys, POLL_TIMEOUT).await?)
    }

    /// Route one popped item: decode, find its handler, run it and settle
    /// the outcome.
    pub async fn dispatch(&self, key: &str, raw: String) {
        Counters::bump(&self.counters.delivered);

        let package = match Package::decode(&raw) {
            Ok(package) => package,
            Err(err) => {
                warn!(key = %key, error = %err, "corrupt package; moving to failed list");
                Counters::bump(&self.counters.corrupt);
                if let Err(err) = self.store.lpush(self.keys.failed(), &raw).await {
                    error!(key = %key, error = %err, "corrupt package could not be dead-lettered");
                }
                return;
            }
        };

        let Some(subscription) = self.registry.get(key) else {
            debug!(key = %key, package_id = %package.id, "no handler registered; returning package");
            Counters::bump(&self.counters.returned);
            if let Err(err) = self.store.rpush(key, &raw).await {
                error!(key = %key, package_id = %package.id, error = %err, "package could not be returned to its queue");
            }
            return;
        };

        match invoke(Arc::clone(&subscription.handler), package.data.clone()).await {
            Ok(()) => {
                Counters::bump(&self.counters.succeeded);
                debug!(queue = %package.queue, package_id = %package.id, "package consumed");
            }
            Err(failure) => {
                warn!(
                    queue = %package.queue,
                    package_id = %package.id,
                    attempts = package.attempts,
                    error = %failure,
                    "handler failed"
                );
                self.settle_failure(package, &failure, subscription.on_failure.as_ref())
                    .await;
            }
        }
    }

    async fn settle_failure(&self, package: Package, failure: &HandlerError, hook: Option<&FailureHook>) {
        match self.decider.decide(package, failure, hook) {
            Disposition::DeadLetter(package) => {
                warn!(
                    queue = %package.queue,
                    package_id = %package.id,
                    attempts = package.attempts,
                    "package dead-lettered"
                );
                Counters::bump(&self.counters.dead_lettered);
                if let Err(err) = self.write(self.keys.failed(), None, &package).await {
                    error!(package_id = %package.id, error = %err, "package could not be dead-lettered");
                }
            }
            Disposition::Retry(package) => {
                Counters::bump(&self.counters.retried);
                let result = if self.retry_seconds > 0 {
                    let backoff = self.retry_seconds.saturating_mul(u64::from(package.attempts));
                    let due = Utc::now().timestamp().saturating_add_unsigned(backoff);
                    self.write(self.keys.delayed(), Some(due), &package).await
                } else {
                    let key = self.keys.waiting(&package.queue);
                    self.write(&key, None, &package).await
                };
                if let Err(err) = result {
                    error!(
                        queue = %package.queue,
                        package_id = %package.id,
                        error = %err,
                        "package could not be requeued for retry"
                    );
                }
            }
        }
    }

    /// LPUSH onto a list, or ZADD at `score` when one is given.
    async fn write(&self, key: &str, score: Option<i64>, package: &Package) -> QueueResult<()> {
        let raw = package.encode()?;
        match score {
            Some(score) => self.store.zadd(key, score, &raw).await?,
            None => self.store.lpush(key, &raw).await?,
        };
        Ok(())
    }
}

/// Run a handler on its own task so a panic turns into a failure instead of
/// taking the loop down.
async fn invoke(handler: Arc<dyn Handler>, data: serde_json::Value) -> HandlerResult {
    match tokio::spawn(async move { handler.handle(data).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(HandlerError::retryable("handler panicked")),
        Err(_) => Err(HandlerError::retryable("handler cancelled")),
    }
}
