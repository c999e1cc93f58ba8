//! Consumer registration: bind a set of [`Consumer`] definitions to the
//! connections they name.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relq_core::{HandlerError, HandlerResult, Package, failure_hook};

use crate::config::DEFAULT_CONNECTION;
use crate::consumer::handler::Handler;
use crate::error::QueueResult;
use crate::manager::QueueManager;

/// A queue consumer definition.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Queue to consume. An empty name skips registration.
    fn queue(&self) -> &str;

    fn connection(&self) -> &str {
        DEFAULT_CONNECTION
    }

    async fn consume(&self, data: JsonValue) -> HandlerResult;

    /// Called with a failed package before it is retried. Returning a
    /// package overrides its `data`, `attempts`, `max_attempts` and `error`.
    fn on_consume_failure(&self, _failure: &HandlerError, _package: &Package) -> anyhow::Result<Option<Package>> {
        Ok(None)
    }
}

struct ConsumerHandler(Arc<dyn Consumer>);

#[async_trait]
impl Handler for ConsumerHandler {
    async fn handle(&self, data: JsonValue) -> HandlerResult {
        self.0.consume(data).await
    }
}

/// What [`register_consumers`] subscribed.
#[derive(Debug, Clone, Default)]
pub struct RegisteredConsumers {
    connections: BTreeSet<String>,
    queues: Vec<String>,
}

impl RegisteredConsumers {
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn connections(&self) -> impl Iterator<Item = &str> {
        self.connections.iter().map(String::as_str)
    }

    /// Close every connection a consumer was registered on.
    pub fn shutdown(self, manager: &QueueManager) -> Vec<JoinHandle<()>> {
        info!(connections = self.connections.len(), "shutting down registered consumers");
        self.connections
            .iter()
            .filter_map(|name| manager.close(name))
            .collect()
    }
}

/// Subscribe every consumer on its connection.
///
/// Stops at the first connection that cannot be opened; consumers
/// registered before that stay subscribed.
pub async fn register_consumers<I>(manager: &QueueManager, consumers: I) -> QueueResult<RegisteredConsumers>
where
    I: IntoIterator<Item = Arc<dyn Consumer>>,
{
    let mut registered = RegisteredConsumers::default();

    for consumer in consumers {
        let queue = consumer.queue().to_string();
        if queue.is_empty() {
            warn!("consumer without a queue name skipped");
            continue;
        }

        let name = consumer.connection().to_string();
        let connection = manager.connection(&name).await?;

        let owner = Arc::clone(&consumer);
        let hook = failure_hook(move |failure, package| owner.on_consume_failure(failure, package));
        connection.subscribe_handler(&queue, ConsumerHandler(consumer), Some(hook))?;

        info!(connection = %name, queue = %queue, "consumer registered");
        registered.connections.insert(name);
        registered.queues.push(queue);
    }

    Ok(registered)
}
