//! The activity logger facade (spec §4.4): the queue engine calls this
//! after every storage-gateway commit. It turns each outcome into a
//! `DetectorContext` and runs the registry for the detectors that need
//! state the gateway itself doesn't track (burst counters, payload/timing
//! thresholds), patching any hit onto the activity row the gateway already
//! wrote and already NOTIFY'd.
//!
//! Anomalies the gateway can see from inside its own transaction
//! (`lock_stolen`, `near_dlq`, `dlq_movement`, `zombie_message`) are attached
//! there directly — this logger's registry pass is complementary, not a
//! replacement for that inline classification.

use std::sync::Arc;

use duramq_core::DetectorConfig;
use duramq_detect::{DetectorContext, DetectorRegistry, EventKind};
use duramq_storage::{ClaimedMessage, StorageError, StorageGateway};
use tracing::warn;
use uuid::Uuid;

use crate::consumer_stats::ConsumerStatsCache;

pub struct ActivityLogger {
    gateway: Arc<dyn StorageGateway>,
    detectors: Arc<DetectorRegistry>,
    consumer_stats: ConsumerStatsCache,
    thresholds: DetectorConfig,
}

impl ActivityLogger {
    pub fn new(gateway: Arc<dyn StorageGateway>, detectors: Arc<DetectorRegistry>, thresholds: DetectorConfig) -> Self {
        Self { gateway, detectors, consumer_stats: ConsumerStatsCache::new(), thresholds }
    }

    pub fn consumer_stats(&self) -> &ConsumerStatsCache {
        &self.consumer_stats
    }

    /// Run the registry against `ctx` and attach the first hit to `log_id`,
    /// if one fires. Detectors are pure per their own contract (§4.5) — a
    /// panic here is a detector bug, not something to recover from.
    async fn classify(&self, ctx: DetectorContext, log_id: Uuid) {
        if let Some(anomaly) = self.detectors.run(&ctx).into_iter().next() {
            if let Err(err) = self.gateway.attach_anomaly(log_id, anomaly).await {
                warn!(?err, "failed to attach anomaly to activity row");
            }
        }
    }

    /// The gateway's `enqueue_one`/`enqueue_batch` don't hand back the
    /// activity row's id (a batch writes a single aggregate row, not one
    /// per message), so a hit here is logged rather than patched onto a
    /// row — acceptable since `large_payload` is info-severity only.
    pub async fn after_enqueue(&self, queue: &str, message_id: duramq_core::MessageId, payload_size: u64) {
        let mut ctx = DetectorContext::new(EventKind::Enqueue, queue, self.thresholds.clone());
        ctx.message_id = Some(message_id);
        ctx.payload_size = Some(payload_size);
        for anomaly in self.detectors.run(&ctx) {
            tracing::info!(?anomaly, queue, "enqueue anomaly");
        }
    }

    pub async fn after_dequeue(&self, queue: &str, consumer_id: &str, claimed: &ClaimedMessage, max_attempts: u32) {
        let burst_window = self.thresholds.burst_seconds;
        let recent = self.consumer_stats.record_dequeue(queue, consumer_id, burst_window);

        let mut ctx = DetectorContext::new(EventKind::Dequeue, queue, self.thresholds.clone());
        ctx.message_id = Some(claimed.message.id);
        ctx.consumer_id = Some(consumer_id.to_string());
        ctx.time_in_queue_ms = Some(claimed.time_in_queue_ms);
        ctx.attempt_count = Some(claimed.message.attempt_count);
        ctx.max_attempts = Some(max_attempts);
        ctx.attempts_remaining = Some(max_attempts.saturating_sub(claimed.message.attempt_count));
        ctx.recent_dequeue_count = Some(recent);

        self.classify(ctx, claimed.log_id).await;
    }

    pub async fn after_ack(&self, queue: &str, message_id: duramq_core::MessageId, log_id: Uuid, processing_time_ms: i64) {
        let mut ctx = DetectorContext::new(EventKind::Ack, queue, self.thresholds.clone());
        ctx.message_id = Some(message_id);
        ctx.processing_time_ms = Some(processing_time_ms);
        self.classify(ctx, log_id).await;
    }

    pub async fn after_nack(&self, queue: &str, message_id: duramq_core::MessageId, log_id: Uuid, attempt_count: u32, max_attempts: u32) {
        let mut ctx = DetectorContext::new(EventKind::Nack, queue, self.thresholds.clone());
        ctx.message_id = Some(message_id);
        ctx.attempt_count = Some(attempt_count);
        ctx.max_attempts = Some(max_attempts);
        self.classify(ctx, log_id).await;
    }

    /// Bulk operations get one aggregate activity row from the gateway with
    /// no single message to attach an anomaly to; any hit here is logged
    /// rather than patched onto a row.
    pub async fn after_bulk(&self, queue: &str, bulk: duramq_detect::BulkOperationType, affected_count: u64) {
        let mut ctx = DetectorContext::new(EventKind::BulkOperation, queue, self.thresholds.clone());
        ctx.bulk_operation = Some(bulk);
        ctx.affected_count = Some(affected_count);
        for anomaly in self.detectors.run(&ctx) {
            tracing::info!(?anomaly, queue, "bulk operation anomaly");
        }
    }

    pub async fn list_activity(
        &self,
        filter: duramq_storage::ActivityFilter,
        page: duramq_storage::Pagination,
    ) -> Result<Vec<duramq_core::ActivityLogEntry>, StorageError> {
        self.gateway.list_activity(filter, page).await
    }
}
