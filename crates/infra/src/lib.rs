//! Reliable queue runtime on Redis lists and sorted sets.
//!
//! Producers push packages onto per-queue waiting lists (or into the shared
//! delayed set), one consumer loop per connection pops them with a bounded
//! `BRPOP`, and failed deliveries are retried or dead-lettered according to
//! the retry state machine in `relq_core`.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod manager;
pub mod producer;
pub mod reaper;
pub mod registration;
pub mod store;

pub use config::{ConnectionConfig, ConnectionOptions, DEFAULT_CONNECTION, QueueConfig};
pub use connection::Connection;
pub use consumer::handler::Handler;
pub use consumer::{ConsumerState, ConsumerStats};
pub use error::{QueueError, QueueResult};
pub use manager::{Connector, InMemoryConnector, QueueManager, global, install_global};
#[cfg(feature = "redis")]
pub use manager::RedisConnector;
pub use producer::Producer;
pub use reaper::{DelayReaper, ReapReport};
pub use registration::{Consumer, RegisteredConsumers, register_consumers};
pub use store::{InMemoryStore, QueueStore, StoreError};
#[cfg(feature = "redis")]
pub use store::RedisStore;
