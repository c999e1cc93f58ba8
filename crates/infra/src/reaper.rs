//! Delay reaper: promotes due packages from the delayed set to their
//! waiting lists.
//!
//! ## Single ownership
//!
//! The range query is not transactional with removal, so several reapers
//! (in this or other processes) may observe the same due member. Each
//! candidate is removed individually and only the reaper whose `ZREM`
//! reports exactly one removed member pushes it on; everyone else skips it.
//! A plain "read batch, push all, remove all" would double-deliver.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relq_core::{Package, QueueKeys};

use crate::store::{QueueStore, StoreError};

/// Time between reaper ticks.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Most delayed members inspected per tick.
pub const REAP_BATCH: usize = 128;

/// Outcome of one reaper tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Moved to their waiting list.
    pub promoted: usize,
    /// Undecodable, moved to the failed list.
    pub corrupt: usize,
    /// Removed by someone else first; skipped.
    pub contended: usize,
}

#[derive(Clone)]
pub struct DelayReaper {
    store: Arc<dyn QueueStore>,
    keys: QueueKeys,
    batch: usize,
}

impl DelayReaper {
    pub fn new(store: Arc<dyn QueueStore>, keys: QueueKeys) -> Self {
        Self {
            store,
            keys,
            batch: REAP_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Run one tick against the current wall clock.
    pub async fn tick(&self) -> Result<ReapReport, StoreError> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Run one tick treating `now` (unix seconds) as the current time.
    ///
    /// Only the fetch can fail the tick; per-member failures are logged and
    /// the member is skipped.
    pub async fn tick_at(&self, now: i64) -> Result<ReapReport, StoreError> {
        let delayed = self.keys.delayed();
        let due = self.store.zrevrangebyscore(delayed, now, self.batch).await?;

        let mut report = ReapReport::default();
        for raw in due {
            match self.store.zrem(delayed, &raw).await {
                Ok(1) => {}
                Ok(_) => {
                    report.contended += 1;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "failed to claim delayed package; leaving it for a later tick");
                    continue;
                }
            }

            match Package::decode(&raw) {
                Ok(package) => {
                    let key = self.keys.waiting(&package.queue);
                    match self.store.lpush(&key, &raw).await {
                        Ok(_) => report.promoted += 1,
                        Err(err) => error!(
                            package_id = %package.id,
                            queue = %package.queue,
                            error = %err,
                            "claimed delayed package could not be promoted"
                        ),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "corrupt delayed package; moving to failed list");
                    match self.store.lpush(self.keys.failed(), &raw).await {
                        Ok(_) => report.corrupt += 1,
                        Err(err) => error!(error = %err, "corrupt delayed package could not be dead-lettered"),
                    }
                }
            }
        }

        if report != ReapReport::default() {
            debug!(
                promoted = report.promoted,
                corrupt = report.corrupt,
                contended = report.contended,
                "reaper tick"
            );
        }
        Ok(report)
    }

    /// Tick every `interval` until stopped.
    ///
    /// A stop request is only observed between ticks, so a claimed member is
    /// always pushed on before the task exits.
    pub fn spawn(self, interval: Duration) -> ReaperHandle {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(error = %err, "delayed set fetch failed; retrying next tick");
                        }
                    }
                }
            }

            info!(prefix = %self.keys.prefix(), "delay reaper stopped");
        });

        ReaperHandle { shutdown, join }
    }
}

/// Handle to a running reaper task.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Request a stop after the current tick; the task can be awaited
    /// through the returned handle.
    pub fn stop(self) -> JoinHandle<()> {
        self.shutdown.notify_one();
        self.join
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn delayed(queue: &str, due: i64) -> (String, i64) {
        let mut package = Package::new(queue, json!({"queue": queue}), 5);
        package.time = due - 5;
        (package.encode().unwrap(), due)
    }

    async fn seed(store: &InMemoryStore, items: &[(String, i64)]) {
        for (raw, due) in items {
            store.zadd("{redis-queue}-delayed", *due, raw).await.unwrap();
        }
    }

    fn reaper(store: &Arc<InMemoryStore>) -> DelayReaper {
        DelayReaper::new(store.clone(), QueueKeys::default())
    }

    #[tokio::test]
    async fn promotes_only_due_packages() {
        let store = InMemoryStore::arc();
        let due = delayed("jobs", NOW - 1);
        let later = delayed("jobs", NOW + 60);
        seed(&store, &[due.clone(), later.clone()]).await;

        let report = reaper(&store).tick_at(NOW).await.unwrap();

        assert_eq!(report.promoted, 1);
        assert_eq!(store.list("{redis-queue}-waitingjobs"), vec![due.0]);
        assert_eq!(store.sorted_set("{redis-queue}-delayed"), vec![later]);
    }

    #[tokio::test]
    async fn packages_are_routed_by_their_own_queue() {
        let store = InMemoryStore::arc();
        seed(&store, &[delayed("emails", NOW), delayed("jobs", NOW)]).await;

        reaper(&store).tick_at(NOW).await.unwrap();

        assert_eq!(store.list("{redis-queue}-waitingemails").len(), 1);
        assert_eq!(store.list("{redis-queue}-waitingjobs").len(), 1);
    }

    #[tokio::test]
    async fn corrupt_members_go_to_the_failed_list() {
        let store = InMemoryStore::arc();
        store
            .zadd("{redis-queue}-delayed", NOW, "{garbage")
            .await
            .unwrap();

        let report = reaper(&store).tick_at(NOW).await.unwrap();

        assert_eq!(report.corrupt, 1);
        assert_eq!(store.list("{redis-queue}-failed"), vec!["{garbage".to_string()]);
        assert!(store.sorted_set("{redis-queue}-delayed").is_empty());
    }

    #[tokio::test]
    async fn batch_caps_work_per_tick() {
        let store = InMemoryStore::arc();
        let items: Vec<_> = (0..5).map(|i| delayed("jobs", NOW - i)).collect();
        seed(&store, &items).await;

        let reaper = reaper(&store).with_batch(2);
        assert_eq!(reaper.tick_at(NOW).await.unwrap().promoted, 2);
        assert_eq!(store.sorted_set("{redis-queue}-delayed").len(), 3);
    }

    /// Yields before every operation so two reapers interleave.
    struct Interleaved(InMemoryStore);

    #[async_trait::async_trait]
    impl QueueStore for Interleaved {
        async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.lpush(key, value).await
        }

        async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.rpush(key, value).await
        }

        async fn brpop(
            &self,
            keys: &[String],
            timeout: Duration,
        ) -> Result<Option<(String, String)>, StoreError> {
            self.0.brpop(keys, timeout).await
        }

        async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.zadd(key, score, member).await
        }

        async fn zrevrangebyscore(
            &self,
            key: &str,
            max: i64,
            limit: usize,
        ) -> Result<Vec<String>, StoreError> {
            tokio::task::yield_now().await;
            self.0.zrevrangebyscore(key, max, limit).await
        }

        async fn zrem(&self, key: &str, member: &str) -> Result<u64, StoreError> {
            tokio::task::yield_now().await;
            self.0.zrem(key, member).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }

        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn concurrent_reapers_promote_each_member_once() {
        let store = InMemoryStore::arc();
        let items: Vec<_> = (0..50).map(|i| delayed("jobs", NOW - i)).collect();
        seed(&store, &items).await;

        let a = DelayReaper::new(Arc::new(Interleaved(store.connect())), QueueKeys::default());
        let b = DelayReaper::new(Arc::new(Interleaved(store.connect())), QueueKeys::default());
        let (ra, rb) = tokio::join!(a.tick_at(NOW), b.tick_at(NOW));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.promoted + rb.promoted, 50);
        assert_eq!(ra.contended + rb.contended, 50);
        let mut waiting = store.list("{redis-queue}-waitingjobs");
        waiting.sort();
        waiting.dedup();
        assert_eq!(waiting.len(), 50);
    }

    #[tokio::test]
    async fn fetch_failure_fails_the_tick() {
        let store = InMemoryStore::arc();
        store.close().await;
        assert!(matches!(
            reaper(&store).tick_at(NOW).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_task() {
        let store = InMemoryStore::arc();
        let handle = reaper(&store).spawn(REAP_INTERVAL);

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.stop().await.unwrap();
    }
}
