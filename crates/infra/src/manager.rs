//! Named-connection registry.
//!
//! Connections are opened lazily on first use and cached by name; concurrent
//! first uses of one name share a single connect attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, DEFAULT_CONNECTION, QueueConfig};
use crate::connection::Connection;
use crate::error::{QueueError, QueueResult};
use crate::store::{InMemoryStore, QueueStore, StoreError};

/// Opens the store behind a named connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> Result<Arc<dyn QueueStore>, StoreError>;
}

/// Connects to Redis at `config.host`.
#[cfg(feature = "redis")]
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[cfg(feature = "redis")]
#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, _name: &str, config: &ConnectionConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
        let store = crate::store::RedisStore::connect(config).await?;
        Ok(Arc::new(store))
    }
}

/// Hands every connection its own handle onto one shared in-memory store.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    store: Arc<InMemoryStore>,
}

impl InMemoryConnector {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, _name: &str, _config: &ConnectionConfig) -> Result<Arc<dyn QueueStore>, StoreError> {
        Ok(Arc::new(self.store.connect()))
    }
}

type Slot = Arc<OnceCell<Connection>>;

pub struct QueueManager {
    config: QueueConfig,
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, Slot>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig, connector: impl Connector + 'static) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            connections: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(feature = "redis")]
    pub fn redis(config: QueueConfig) -> Self {
        Self::new(config, RedisConnector)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The connection called `name`, opening it on first use.
    ///
    /// Names missing from the configuration fail with
    /// [`QueueError::UnknownConnection`]; a failed connect is not cached.
    pub async fn connection(&self, name: &str) -> QueueResult<Connection> {
        let config = self
            .config
            .get(name)
            .ok_or_else(|| QueueError::UnknownConnection(name.to_string()))?;

        let slot = self.slots().entry(name.to_string()).or_default().clone();
        let connection = slot
            .get_or_try_init(|| async {
                let store = self.connector.connect(name, config).await?;
                Ok::<_, QueueError>(Connection::new(name, store, &config.options))
            })
            .await?;
        Ok(connection.clone())
    }

    pub async fn default_connection(&self) -> QueueResult<Connection> {
        self.connection(DEFAULT_CONNECTION).await
    }

    /// Enqueue on the `default` connection.
    pub async fn send<T>(&self, queue: &str, data: &T) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.default_connection().await?.send(queue, data).await
    }

    /// Enqueue on the `default` connection after `delay`.
    pub async fn send_with_delay<T>(&self, queue: &str, data: &T, delay: Duration) -> QueueResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.default_connection()
            .await?
            .send_with_delay(queue, data, delay)
            .await
    }

    /// Names of the connections opened so far.
    pub fn open_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Close and forget the connection called `name`. The next
    /// [`connection`](Self::connection) call opens a fresh one.
    pub fn close(&self, name: &str) -> Option<JoinHandle<()>> {
        let slot = self.slots().remove(name)?;
        slot.get().and_then(Connection::close)
    }

    pub fn close_all(&self) -> Vec<JoinHandle<()>> {
        let slots: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        slots
            .iter()
            .filter_map(|slot| slot.get().and_then(Connection::close))
            .collect()
    }
}

static GLOBAL: OnceLock<QueueManager> = OnceLock::new();

/// Install the process-wide manager. Hands `manager` back if one is
/// already installed.
pub fn install_global(manager: QueueManager) -> Result<(), QueueManager> {
    GLOBAL.set(manager)
}

pub fn global() -> Option<&'static QueueManager> {
    GLOBAL.get()
}
