use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use relq_core::HandlerResult;
use relq_infra::{Consumer, QueueConfig, QueueManager, register_consumers};

/// Logs every package it receives and acknowledges it.
struct LogConsumer {
    queue: String,
}

#[async_trait]
impl Consumer for LogConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn consume(&self, data: JsonValue) -> HandlerResult {
        tracing::info!(queue = %self.queue, data = %data, "package received");
        Ok(())
    }
}

/// Queue names from a comma separated list, blanks dropped.
fn parse_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relq_observability::init();

    let queues = std::env::var("RELQ_QUEUES").unwrap_or_else(|_| {
        tracing::warn!("RELQ_QUEUES not set; consuming \"default\"");
        "default".to_string()
    });

    let manager = QueueManager::redis(QueueConfig::from_env());
    let consumers = parse_queues(&queues)
        .into_iter()
        .map(|queue| Arc::new(LogConsumer { queue }) as Arc<dyn Consumer>);
    let registered = register_consumers(&manager, consumers).await?;

    tracing::info!(queues = ?registered.queues(), "runner started; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    for task in registered.shutdown(&manager) {
        task.await?;
    }
    tracing::info!("runner stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_list_drops_blanks() {
        assert_eq!(parse_queues(" emails, ,jobs,"), vec!["emails", "jobs"]);
        assert!(parse_queues("").is_empty());
    }
}
