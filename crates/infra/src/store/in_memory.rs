use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{QueueStore, StoreError};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    pushed: Notify,
}

/// In-memory list / sorted-set store.
///
/// Intended for tests/dev. Every handle obtained through [`InMemoryStore::connect`]
/// shares the same data, the way several clients share one server; closing a
/// handle does not affect the others.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// A new handle onto the same data.
    pub fn connect(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of a list, head first (the tail is popped next).
    pub fn list(&self, key: &str) -> Vec<String> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a sorted set as `(member, score)`, lowest score first.
    pub fn sorted_set(&self, key: &str) -> Vec<(String, i64)> {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut members: Vec<_> = state
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.shared
            .state
            .lock()
            .map_err(|_| StoreError::Command("lock poisoned".to_string()))
    }

    fn push(&self, key: &str, value: &str, head: bool) -> Result<u64, StoreError> {
        let len = {
            let mut state = self.state()?;
            let list = state.lists.entry(key.to_string()).or_default();
            if head {
                list.push_front(value.to_string());
            } else {
                list.push_back(value.to_string());
            }
            list.len() as u64
        };
        self.shared.pushed.notify_waiters();
        Ok(len)
    }

    fn try_pop(&self, keys: &[String]) -> Result<Option<(String, String)>, StoreError> {
        let mut state = self.state()?;
        for key in keys {
            if let Some(value) = state.lists.get_mut(key).and_then(|l| l.pop_back()) {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, true)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, false)
    }

    async fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking so a push in between is not missed.
            let pushed = self.shared.pushed.notified();
            if let Some(hit) = self.try_pop(keys)? {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let set = state.sorted_sets.entry(key.to_string()).or_default();
        Ok(match set.insert(member.to_string(), score) {
            Some(_) => 0,
            None => 1,
        })
    }

    async fn zrevrangebyscore(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(vec![]);
        };

        let mut due: Vec<(&String, i64)> = set
            .iter()
            .filter(|(_, score)| **score <= max)
            .map(|(member, score)| (member, *score))
            .collect();
        due.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));
        Ok(due.into_iter().take(limit).map(|(m, _)| m.clone()).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        let removed = state
            .sorted_sets
            .get_mut(key)
            .and_then(|set| set.remove(member))
            .is_some();
        Ok(u64::from(removed))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state().map(|_| ())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shared.pushed.notify_waiters();
    }
}
