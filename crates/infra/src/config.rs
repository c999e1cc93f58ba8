//! Configuration for named queue connections.
//!
//! Parsing configuration files is left to the application; these types only
//! need to deserialize from whatever it loads (`serde`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use relq_core::DEFAULT_PREFIX;

/// Name of the connection used when none is given.
pub const DEFAULT_CONNECTION: &str = "default";

const DEFAULT_HOST: &str = "redis://127.0.0.1:6379";

/// All configured connections, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueConfig {
    pub connections: HashMap<String, ConnectionConfig>,
}

impl QueueConfig {
    /// A config with a single `default` connection.
    pub fn single(config: ConnectionConfig) -> Self {
        Self::default().with_connection(DEFAULT_CONNECTION, config)
    }

    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }

    /// Build the `default` connection from the environment.
    ///
    /// - `RELQ_REDIS_URL` (falls back to a local server)
    /// - `RELQ_PREFIX`
    /// - `RELQ_MAX_ATTEMPTS`
    pub fn from_env() -> Self {
        let host = std::env::var("RELQ_REDIS_URL").unwrap_or_else(|_| {
            warn!("RELQ_REDIS_URL not set; using {DEFAULT_HOST}");
            DEFAULT_HOST.to_string()
        });

        let mut options = ConnectionOptions::default();
        if let Ok(prefix) = std::env::var("RELQ_PREFIX") {
            options.prefix = prefix;
        }
        if let Ok(raw) = std::env::var("RELQ_MAX_ATTEMPTS") {
            match raw.parse() {
                Ok(max_attempts) => options.max_attempts = max_attempts,
                Err(_) => warn!(value = %raw, "ignoring invalid RELQ_MAX_ATTEMPTS"),
            }
        }

        Self::single(ConnectionConfig { host, options })
    }
}

/// One named connection: a store address plus options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Store address, e.g. `redis://127.0.0.1:6379`.
    pub host: String,
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Key prefix shared by every key of this connection.
    pub prefix: String,
    /// Connect timeout in seconds.
    pub timeout: f64,
    /// Database index selected after connecting.
    #[serde(alias = "db")]
    pub database: i64,
    /// Password sent with `AUTH`.
    pub auth: Option<String>,
    /// Keepalive interval in seconds; 0 disables it.
    pub ping: u64,
    /// Failed deliveries tolerated before a package is dead-lettered.
    pub max_attempts: u32,
    /// Retry backoff step in seconds. A retried package is delayed by
    /// `retry_seconds * attempts`; 0 re-queues it immediately.
    pub retry_seconds: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: 2.0,
            database: 0,
            auth: None,
            ping: 55,
            max_attempts: 5,
            retry_seconds: 0,
        }
    }
}

impl ConnectionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::from_secs(2))
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.ping > 0).then(|| Duration::from_secs(self.ping))
    }
}
