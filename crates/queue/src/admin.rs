//! Administration surface (spec §4.7, C7): queue CRUD, purge, metrics, and
//! config introspection. Thin wrapper over the storage gateway plus the
//! activity logger's consumer-stats cache for per-consumer metrics.

use std::collections::HashMap;
use std::sync::Arc;

use duramq_activity::ActivityLogger;
use duramq_core::{validate_queue_name, BrokerError, BrokerResult, Config, ConsumerStats, Queue, QueueDepth};
use duramq_storage::{NewQueue, QueuePatch, StorageGateway};

#[derive(Debug, Clone)]
pub struct QueueSummary {
    pub queue: Queue,
    pub depth: QueueDepth,
}

#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub depth: QueueDepth,
    pub consumers: HashMap<String, ConsumerStats>,
}

pub struct AdminApi {
    gateway: Arc<dyn StorageGateway>,
    logger: Arc<ActivityLogger>,
}

impl AdminApi {
    pub fn new(gateway: Arc<dyn StorageGateway>, logger: Arc<ActivityLogger>) -> Self {
        Self { gateway, logger }
    }

    pub async fn create_queue(&self, queue: NewQueue) -> BrokerResult<Queue> {
        validate_queue_name(&queue.name)?;
        Ok(self.gateway.create_queue(queue).await?)
    }

    pub async fn get_queue(&self, name: &str) -> BrokerResult<Queue> {
        self.gateway.get_queue(name).await?.ok_or_else(|| BrokerError::NotFound(format!("queue {}", name)))
    }

    pub async fn list_queues(&self) -> BrokerResult<Vec<QueueSummary>> {
        let queues = self.gateway.list_queues().await?;
        let mut summaries = Vec::with_capacity(queues.len());
        for queue in queues {
            let depth = self.gateway.queue_depth(&queue.name).await?;
            summaries.push(QueueSummary { queue, depth });
        }
        Ok(summaries)
    }

    pub async fn update_queue(&self, name: &str, patch: QueuePatch) -> BrokerResult<Queue> {
        Ok(self.gateway.update_queue(name, patch).await?)
    }

    pub async fn rename_queue(&self, old_name: &str, new_name: &str) -> BrokerResult<Queue> {
        validate_queue_name(new_name)?;
        Ok(self.gateway.rename_queue(old_name, new_name).await?)
    }

    /// Refuses when the queue has any non-terminal messages unless
    /// `force=true`, in which case it purges first (§4.7).
    pub async fn delete_queue(&self, name: &str, force: bool) -> BrokerResult<()> {
        if force {
            self.gateway.purge_queue(name).await?;
        }
        Ok(self.gateway.delete_queue(name, force).await?)
    }

    pub async fn purge_queue(&self, name: &str) -> BrokerResult<u64> {
        Ok(self.gateway.purge_queue(name).await?)
    }

    pub async fn get_metrics(&self, name: &str) -> BrokerResult<QueueMetrics> {
        let depth = self.gateway.queue_depth(name).await?;
        let consumers = self.logger.consumer_stats().all_for_queue(name);
        Ok(QueueMetrics { depth, consumers })
    }

    pub fn get_config(&self, config: &Config) -> serde_json::Value {
        config.redacted_summary()
    }
}
