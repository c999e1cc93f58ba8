//! Redis-backed store adapter.
//!
//! Two multiplexed connections per store:
//! - **command**: pushes, sorted-set operations, keepalive
//! - **blocking**: `BRPOP` only, so a waiting pop never stalls a push
//!
//! Key layout is owned by `relq_core::QueueKeys`; this module only speaks
//! the wire commands.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::IntoConnectionInfo;
use redis::aio::MultiplexedConnection;
use tracing::{info, instrument};

use crate::config::ConnectionConfig;

use super::{QueueStore, StoreError};

pub struct RedisStore {
    command: Mutex<Option<MultiplexedConnection>>,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Open both channels to the server described by `config`.
    ///
    /// Applies the configured database index and password; each channel
    /// must connect within `options.timeout` seconds.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, StoreError> {
        let options = &config.options;
        let mut info = config
            .host
            .as_str()
            .into_connection_info()
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if options.database != 0 {
            info.redis.db = options.database;
        }
        if let Some(auth) = &options.auth {
            info.redis.password = Some(auth.clone());
        }

        let client =
            redis::Client::open(info).map_err(|e| StoreError::Connection(e.to_string()))?;
        let timeout = options.connect_timeout();

        let command = open(&client, timeout).await?;
        let blocking = open(&client, timeout).await?;

        info!(host = %config.host, db = options.database, "redis store connected");

        Ok(Self {
            command: Mutex::new(Some(command)),
            blocking: Mutex::new(Some(blocking)),
        })
    }

    fn command(&self) -> Result<MultiplexedConnection, StoreError> {
        checkout(&self.command)
    }

    fn blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        checkout(&self.blocking)
    }
}

async fn open(
    client: &redis::Client,
    timeout: Duration,
) -> Result<MultiplexedConnection, StoreError> {
    tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
        .map_err(|e| StoreError::Connection(e.to_string()))
}

fn checkout(
    slot: &Mutex<Option<MultiplexedConnection>>,
) -> Result<MultiplexedConnection, StoreError> {
    slot.lock()
        .map_err(|_| StoreError::Connection("lock poisoned".to_string()))?
        .clone()
        .ok_or(StoreError::Closed)
}

fn command_error(command: &'static str) -> impl Fn(redis::RedisError) -> StoreError {
    move |e| StoreError::Command(format!("{command} failed: {e}"))
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.command()?;
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(command_error("LPUSH"))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.command()?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(command_error("RPUSH"))
    }

    #[instrument(level = "trace", skip(self), err)]
    async fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let mut conn = self.blocking()?;
        // Whole seconds keep compatibility with servers older than 6.0.
        let wait = timeout.as_secs().max(1);
        redis::cmd("BRPOP")
            .arg(keys)
            .arg(wait)
            .query_async(&mut conn)
            .await
            .map_err(command_error("BRPOP"))
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<u64, StoreError> {
        let mut conn = self.command()?;
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZADD"))
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn zrevrangebyscore(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.command()?;
        redis::cmd("ZREVRANGEBYSCORE")
            .arg(key)
            .arg(max)
            .arg("-inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZREVRANGEBYSCORE"))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut conn = self.command()?;
        redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(command_error("ZREM"))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.command()?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(command_error("PING"))?;
        Ok(())
    }

    async fn close(&self) {
        // Dropping the last clone of a multiplexed connection shuts its
        // driver task down.
        for slot in [&self.command, &self.blocking] {
            let conn = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            drop(conn);
        }
    }
}
