//! Store adapter: the list / sorted-set primitives the queue is built on.
//!
//! The queue needs only a handful of single-key atomic operations from the
//! backing store:
//!
//! - list push at either end, blocking pop from the tail across several keys
//! - sorted-set add, descending range-by-score with a limit, remove with count
//!
//! Cross-process safety relies on these being atomic in the store itself
//! (e.g. `ZREM` reporting how many members it removed), never on locks held
//! outside of it.

use std::time::Duration;

use async_trait::async_trait;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Store operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store connection closed")]
    Closed,

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Async access to a list / sorted-set store.
///
/// Implementations keep blocking pops off the channel used for ordinary
/// commands, so a pop that is waiting never delays a push.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push onto the head of a list. Returns the list length after the push.
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Push onto the tail of a list. Returns the list length after the push.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pop from the tail of the first non-empty list in `keys`, waiting up to
    /// `timeout` for one to become non-empty.
    ///
    /// Returns `(key, value)` or `None` when the wait elapsed.
    async fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Add `member` with `score`. Returns the number of newly added members.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<u64, StoreError>;

    /// Members with score `<= max`, highest score first, at most `limit`.
    async fn zrevrangebyscore(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove `member`. Returns the number of removed members (0 or 1).
    async fn zrem(&self, key: &str, member: &str) -> Result<u64, StoreError>;

    /// Keepalive round trip on the command channel.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Tear down both channels. Later operations fail with [`StoreError::Closed`].
    async fn close(&self);
}
