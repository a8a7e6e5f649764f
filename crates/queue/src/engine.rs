//! The queue engine (spec §4.3, C4): enqueue, dequeue, acknowledge, nack,
//! touch, move, delete, clear, list/export/import. Each operation wraps a
//! storage-gateway call in [`crate::retry::with_retry`] and then calls into
//! the activity logger (C3) for post-commit anomaly classification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use duramq_activity::ActivityLogger;
use duramq_core::{
    ActorConfig, BrokerError, BrokerResult, Message, MessageId, MessageStatus, Queue, QueueDepth,
};
use duramq_detect::BulkOperationType;
use duramq_storage::{
    AckOutcome, AckRequest, ClaimedMessage, MoveOutcome, MoveRequest, MoveTarget, NackOutcome,
    NackRequest, NewMessage, StorageGateway, TouchOutcome, TouchRequest,
};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::EnqueueBuffer;
use crate::retry::with_retry;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub message_type: Option<String>,
    pub priority: u8,
    pub custom_max_attempts: Option<u32>,
    pub custom_ack_timeout_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    pub count: u32,
    pub type_filter: Option<String>,
    pub ack_timeout_seconds: Option<u32>,
    /// 0 = return immediately if nothing is ready.
    pub wait_timeout_seconds: u64,
}

impl DequeueOptions {
    fn normalized_count(&self) -> u32 {
        self.count.max(1)
    }
}

pub struct QueueEngine {
    gateway: Arc<dyn StorageGateway>,
    logger: Arc<ActivityLogger>,
    actors: ActorConfig,
    buffer: Option<Mutex<EnqueueBuffer>>,
    closed: AtomicBool,
}

impl QueueEngine {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        logger: Arc<ActivityLogger>,
        actors: ActorConfig,
        buffer_config: &duramq_core::BufferConfig,
    ) -> Self {
        let buffer = buffer_config
            .enabled
            .then(|| Mutex::new(EnqueueBuffer::new(buffer_config.max_size, StdDuration::from_millis(buffer_config.max_wait_ms))));
        Self { gateway, logger, actors, buffer, closed: AtomicBool::new(false) }
    }

    /// Reject new enqueues; in-flight ack/nack/touch calls still complete
    /// (spec §7 lifecycle policy).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    // ── Enqueue (§4.2, §4.3) ──────────────────────────────────────────

    pub async fn enqueue(&self, queue: &str, payload: Vec<u8>, opts: EnqueueOptions) -> BrokerResult<MessageId> {
        self.check_open()?;
        if self.gateway.get_queue(queue).await?.is_none() {
            return Err(BrokerError::NotFound(format!("queue {}", queue)));
        }

        let id = Uuid::new_v4();
        let payload_size = payload.len() as u64;
        let msg = NewMessage {
            id,
            queue: queue.to_string(),
            message_type: opts.message_type,
            priority: Message::clamp_priority(opts.priority),
            payload,
            custom_max_attempts: opts.custom_max_attempts,
            custom_ack_timeout_seconds: opts.custom_ack_timeout_seconds,
        };

        if let Some(buffer) = &self.buffer {
            let mut guard = buffer.lock().await;
            if guard.is_full() {
                return Err(BrokerError::Busy(format!("enqueue buffer full for queue {}", queue)));
            }
            guard.push(msg);
            let flush_now = guard.should_flush();
            if flush_now {
                let batch = guard.flush();
                drop(guard);
                self.flush_batch(batch).await?;
            }
            return Ok(id);
        }

        with_retry(|| self.gateway.enqueue_one(msg.clone(), &self.actors.relay_actor)).await?;
        self.logger.after_enqueue(queue, id, payload_size).await;
        Ok(id)
    }

    async fn flush_batch(&self, batch: Vec<NewMessage>) -> BrokerResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let queue = batch[0].queue.clone();
        let sizes: Vec<(MessageId, u64)> = batch.iter().map(|m| (m.id, m.payload.len() as u64)).collect();
        with_retry(|| self.gateway.enqueue_batch(batch.clone(), &self.actors.relay_actor)).await?;
        for (id, size) in sizes {
            self.logger.after_enqueue(&queue, id, size).await;
        }
        Ok(())
    }

    /// Force an immediate flush of whatever is currently buffered,
    /// regardless of thresholds. A no-op when buffering is disabled.
    pub async fn flush(&self) -> BrokerResult<()> {
        let Some(buffer) = &self.buffer else { return Ok(()) };
        let batch = {
            let mut guard = buffer.lock().await;
            guard.flush()
        };
        self.flush_batch(batch).await
    }

    // ── Dequeue (§4.3) ─────────────────────────────────────────────────

    pub async fn dequeue(&self, queue: &str, consumer_id: &str, opts: DequeueOptions) -> BrokerResult<Vec<ClaimedMessage>> {
        let queue_row = self.gateway.get_queue(queue).await?.ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue)))?;
        let ack_timeout = opts
            .ack_timeout_seconds
            .map(|s| Duration::seconds(s as i64))
            .unwrap_or_else(|| queue_row.ack_timeout());
        let count = opts.normalized_count();

        let mut claimed = with_retry(|| {
            self.gateway.dequeue_claim(queue, count, consumer_id, opts.type_filter.as_deref(), ack_timeout, &self.actors.relay_actor)
        })
        .await?;

        if claimed.is_empty() && opts.wait_timeout_seconds > 0 {
            self.wait_for_enqueue(queue, opts.wait_timeout_seconds).await;
            claimed = with_retry(|| {
                self.gateway.dequeue_claim(queue, count, consumer_id, opts.type_filter.as_deref(), ack_timeout, &self.actors.relay_actor)
            })
            .await?;
        }

        for item in &claimed {
            let max_attempts = item.message.effective_max_attempts(&queue_row);
            self.logger.after_dequeue(queue, consumer_id, item, max_attempts).await;
        }
        Ok(claimed)
    }

    /// Bounded wait on the event bus for an enqueue notification on this
    /// queue (Design Notes: "do not hold DB transactions across the
    /// wait"). Returns as soon as a matching event arrives, a lag signal
    /// fires, or the deadline passes — the caller always retries the claim
    /// exactly once afterward regardless of which of those happened.
    async fn wait_for_enqueue(&self, queue: &str, wait_timeout_seconds: u64) {
        let mut sub = duramq_activity::subscribe(self.gateway.as_ref(), format!("dequeue-wait:{queue}"));
        let deadline = StdDuration::from_secs(wait_timeout_seconds);
        let _ = tokio::time::timeout(deadline, async {
            loop {
                match sub.recv().await {
                    Some(duramq_activity::SubscriptionItem::Event(event)) if event.queue == queue => return,
                    Some(_) => continue,
                    None => return,
                }
            }
        })
        .await;
    }

    // ── Ack / nack / touch (§4.3) ───────────────────────────────────────

    pub async fn acknowledge(&self, queue: &str, message_id: MessageId, lock_token: Uuid, consumer_id: &str) -> BrokerResult<()> {
        let req = AckRequest { message_id, lock_token, consumer_id: consumer_id.to_string() };
        match with_retry(|| self.gateway.acknowledge(req.clone(), &self.actors.relay_actor)).await? {
            AckOutcome::Acknowledged { log_id, processing_time_ms } => {
                self.logger.after_ack(queue, message_id, log_id, processing_time_ms).await;
                Ok(())
            }
            AckOutcome::LockMismatch { log_id, anomaly } => {
                warn!(%message_id, ?anomaly, "ack lock mismatch");
                self.logger.after_ack(queue, message_id, log_id, 0).await;
                Err(BrokerError::LockMismatch { message_id })
            }
        }
    }

    /// `dlq_movement` is the only detector subscribed to the nack/timeout
    /// events (§4.5), and the gateway already classifies and attaches it
    /// inline from inside the same transaction that performs the state
    /// transition — so there is nothing left for the registry to add here.
    pub async fn nack(&self, _queue: &str, message_id: MessageId, lock_token: Uuid, consumer_id: &str, reason: Option<String>) -> BrokerResult<()> {
        let req = NackRequest { message_id, lock_token, consumer_id: consumer_id.to_string(), reason };
        match with_retry(|| self.gateway.nack(req.clone(), &self.actors.relay_actor)).await? {
            NackOutcome::Requeued { attempts_remaining, .. } => {
                info!(%message_id, attempts_remaining, "message requeued after nack");
                Ok(())
            }
            NackOutcome::DeadLettered { anomaly, .. } => {
                info!(%message_id, ?anomaly, "message moved to dead");
                Ok(())
            }
            NackOutcome::LockMismatch { anomaly, .. } => {
                warn!(%message_id, ?anomaly, "nack lock mismatch");
                Err(BrokerError::LockMismatch { message_id })
            }
        }
    }

    /// Extends the lock by the queue's configured ack timeout. Per-message
    /// `custom_ack_timeout_seconds` overrides are not applied here since the
    /// gateway has no single-message lookup in its trait surface; a touch
    /// always extends by the queue default.
    pub async fn touch(&self, queue: &str, message_id: MessageId, lock_token: Uuid) -> BrokerResult<chrono::DateTime<chrono::Utc>> {
        let queue_row = self.gateway.get_queue(queue).await?.ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue)))?;
        let req = TouchRequest { message_id, lock_token };
        match with_retry(|| self.gateway.touch(req.clone(), queue_row.ack_timeout())).await? {
            TouchOutcome::Extended { locked_until } => Ok(locked_until),
            TouchOutcome::LockMismatch => Err(BrokerError::LockMismatch { message_id }),
        }
    }

    // ── Bulk operations (§4.3) ──────────────────────────────────────────

    pub async fn move_messages(&self, target: MoveTarget, dest_status: MessageStatus, dest_queue: Option<String>, queue_label: &str) -> BrokerResult<MoveOutcome> {
        let req = MoveRequest { target, dest_status, dest_queue: dest_queue.clone(), triggered_by: self.actors.manual_actor.clone() };
        let outcome = with_retry(|| self.gateway.move_messages(req.clone())).await?;
        if outcome.affected_count > 0 {
            self.gateway.notify(&duramq_core::QueueEvent {
                queue: queue_label.to_string(),
                action: duramq_core::ActivityAction::Move,
                message_id: None,
                timestamp: chrono::Utc::now(),
            }).await?;
            self.logger.after_bulk(queue_label, BulkOperationType::Move, outcome.affected_count).await;
        }
        Ok(outcome)
    }

    pub async fn delete_messages(&self, queue_label: &str, ids: Vec<MessageId>) -> BrokerResult<u64> {
        let count = with_retry(|| self.gateway.delete_messages(ids.clone(), &self.actors.manual_actor)).await?;
        if count > 0 {
            self.gateway.notify(&duramq_core::QueueEvent {
                queue: queue_label.to_string(),
                action: duramq_core::ActivityAction::Delete,
                message_id: None,
                timestamp: chrono::Utc::now(),
            }).await?;
            self.logger.after_bulk(queue_label, BulkOperationType::Delete, count).await;
        }
        Ok(count)
    }

    pub async fn clear_queue(&self, queue: &str, status: Option<MessageStatus>) -> BrokerResult<u64> {
        let count = with_retry(|| self.gateway.clear_queue(queue, status, &self.actors.manual_actor)).await?;
        if count > 0 {
            self.gateway.notify(&duramq_core::QueueEvent {
                queue: queue.to_string(),
                action: duramq_core::ActivityAction::Clear,
                message_id: None,
                timestamp: chrono::Utc::now(),
            }).await?;
            self.logger.after_bulk(queue, BulkOperationType::Clear, count).await;
        }
        Ok(count)
    }

    // ── Read / export / import (§4.3) ────────────────────────────────────

    pub async fn list_messages(&self, filter: duramq_storage::MessageFilter, page: duramq_storage::Pagination) -> BrokerResult<Vec<Message>> {
        Ok(self.gateway.list_messages(filter, page).await?)
    }

    pub async fn export_messages(&self, queue: &str) -> BrokerResult<Vec<Message>> {
        Ok(self.gateway.export_messages(queue).await?)
    }

    /// Restores a dump produced by `export_messages`. Per the Open Question
    /// decision in DESIGN.md: any message not in status=queued is imported
    /// as queued, never as processing.
    pub async fn import_messages(&self, queue: &str, mut messages: Vec<Message>) -> BrokerResult<Vec<MessageId>> {
        for m in &mut messages {
            m.status = MessageStatus::Queued;
            m.consumer_id = None;
            m.lock_token = None;
            m.locked_at = None;
            m.locked_until = None;
        }
        Ok(self.gateway.import_messages(queue, messages, &self.actors.manual_actor).await?)
    }

    pub async fn queue_depth(&self, queue: &str) -> BrokerResult<QueueDepth> {
        Ok(self.gateway.queue_depth(queue).await?)
    }

    pub fn gateway(&self) -> &Arc<dyn StorageGateway> {
        &self.gateway
    }

    pub fn logger(&self) -> &Arc<ActivityLogger> {
        &self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use duramq_core::{ActivityAction, AnomalySeverity, BufferConfig, DetectorConfig, MessageStatus};
    use duramq_detect::DetectorRegistry;
    use duramq_storage::{InMemoryStorageGateway, MoveTarget, NewQueue};

    fn test_engine() -> QueueEngine {
        let gateway: Arc<dyn StorageGateway> = Arc::new(InMemoryStorageGateway::new());
        let detectors = Arc::new(DetectorRegistry::with_builtins());
        let logger = Arc::new(ActivityLogger::new(gateway.clone(), detectors, DetectorConfig::default()));
        let actors = ActorConfig { relay_actor: "relay".into(), manual_actor: "manual".into() };
        let buffer = BufferConfig { enabled: false, max_size: 100, max_wait_ms: 50 };
        QueueEngine::new(gateway, logger, actors, &buffer)
    }

    async fn make_queue(engine: &QueueEngine, name: &str, max_attempts: u32) {
        engine
            .gateway()
            .create_queue(NewQueue {
                name: name.to_string(),
                queue_type: duramq_core::QueueType::Standard,
                ack_timeout_seconds: 30,
                max_attempts,
                partition_interval: None,
                retention_interval: None,
                description: None,
            })
            .await
            .unwrap();
    }

    async fn dequeue_one(engine: &QueueEngine, queue: &str, consumer: &str) -> ClaimedMessage {
        let claimed = engine.dequeue(queue, consumer, DequeueOptions { count: 1, ..Default::default() }).await.unwrap();
        assert_eq!(claimed.len(), 1);
        claimed.into_iter().next().unwrap()
    }

    // S1: basic lifecycle — enqueue, dequeue, ack; activity records the
    // three actions in order and the message ends acknowledged.
    #[tokio::test]
    async fn s1_basic_lifecycle() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;

        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let claimed = dequeue_one(&engine, "orders", "c1").await;
        assert_eq!(claimed.message.id, id);
        assert_eq!(claimed.message.status, MessageStatus::Processing);

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        engine.acknowledge("orders", id, claimed.message.lock_token.unwrap(), "c1").await.unwrap();

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Acknowledged);
        assert!(m.consumer_id.is_none());
        assert!(m.lock_token.is_none());

        let mut activity = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap();
        activity.retain(|a| a.message_id == Some(id));
        activity.sort_by_key(|a| a.timestamp);
        let actions: Vec<ActivityAction> = activity.iter().map(|a| a.action).collect();
        assert_eq!(actions, vec![ActivityAction::Enqueue, ActivityAction::Dequeue, ActivityAction::Ack]);
    }

    // S2: timeout requeue — a claimed message whose lock expires is reaped
    // back to queued with attempt_count preserved, then a second consumer
    // can claim and ack it.
    #[tokio::test]
    async fn s2_timeout_requeue() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        let first = dequeue_one(&engine, "orders", "c1").await;
        assert_eq!(first.message.attempt_count, 1);

        let future = Utc::now() + Duration::seconds(60);
        let outcomes = engine.gateway().reap_expired(future, "reaper").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].requeued);

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Queued);
        assert_eq!(m.attempt_count, 1);

        let second = dequeue_one(&engine, "orders", "c2").await;
        assert_eq!(second.message.attempt_count, 2);
        engine.acknowledge("orders", id, second.message.lock_token.unwrap(), "c2").await.unwrap();
    }

    // S3: DLQ on exhaustion — max_attempts=1, a single nack dead-letters
    // the message and records a warning-severity dlq_movement anomaly.
    #[tokio::test]
    async fn s3_dlq_on_exhaustion() {
        let engine = test_engine();
        make_queue(&engine, "orders", 1).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        let claimed = dequeue_one(&engine, "orders", "c1").await;

        engine.nack("orders", id, claimed.message.lock_token.unwrap(), "c1", Some("boom".into())).await.unwrap();

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Dead);

        let activity = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap();
        let dlq_row = activity.iter().find(|a| a.message_id == Some(id) && a.action == ActivityAction::Dlq).unwrap();
        let anomaly = dlq_row.anomaly.as_ref().unwrap();
        assert_eq!(anomaly.anomaly_type, "dlq_movement");
        assert_eq!(anomaly.severity, AnomalySeverity::Warning);
    }

    // S4: lock stolen — a reaped lock is reclaimed by a second consumer;
    // the original consumer's ack with the stale token is rejected and
    // logged as a critical lock_stolen anomaly.
    #[tokio::test]
    async fn s4_lock_stolen() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        let first = dequeue_one(&engine, "orders", "c1").await;
        let stale_token = first.message.lock_token.unwrap();

        let future = Utc::now() + Duration::seconds(60);
        engine.gateway().reap_expired(future, "reaper").await.unwrap();
        let second = dequeue_one(&engine, "orders", "c2").await;
        assert_ne!(second.message.lock_token.unwrap(), stale_token);

        let err = engine.acknowledge("orders", id, stale_token, "c1").await.unwrap_err();
        assert!(matches!(err, BrokerError::LockMismatch { message_id } if message_id == id));

        let activity = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap();
        let ack_row = activity.iter().find(|a| a.message_id == Some(id) && a.action == ActivityAction::Ack).unwrap();
        let anomaly = ack_row.anomaly.as_ref().unwrap();
        assert_eq!(anomaly.anomaly_type, "lock_stolen");
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
    }

    // S5: priority desc, then FIFO within a priority tier.
    #[tokio::test]
    async fn s5_priority_then_fifo_ordering() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let a = engine.enqueue("orders", b"a".to_vec(), EnqueueOptions { priority: 0, ..Default::default() }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let b = engine.enqueue("orders", b"b".to_vec(), EnqueueOptions { priority: 9, ..Default::default() }).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let c = engine.enqueue("orders", b"c".to_vec(), EnqueueOptions { priority: 0, ..Default::default() }).await.unwrap();

        let claimed = engine.dequeue("orders", "c1", DequeueOptions { count: 3, ..Default::default() }).await.unwrap();
        let ids: Vec<MessageId> = claimed.iter().map(|c| c.message.id).collect();
        assert_eq!(ids, vec![b, a, c]);
    }

    // S6: bulk clear — clearing all queued messages in one call produces a
    // single aggregate activity row and a warning-severity anomaly.
    #[tokio::test]
    async fn s6_bulk_clear() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        for i in 0..100 {
            engine.enqueue("orders", format!("msg-{i}").into_bytes(), EnqueueOptions::default()).await.unwrap();
        }

        let count = engine.clear_queue("orders", Some(MessageStatus::Queued)).await.unwrap();
        assert_eq!(count, 100);

        let depth = engine.queue_depth("orders").await.unwrap();
        assert_eq!(depth.queued, 0);

        let activity = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap();
        let clear_rows: Vec<_> = activity.iter().filter(|a| a.action == ActivityAction::Clear).collect();
        assert_eq!(clear_rows.len(), 1);
        assert_eq!(clear_rows[0].batch_size, Some(100));
        let anomaly = clear_rows[0].anomaly.as_ref().unwrap();
        assert_eq!(anomaly.anomaly_type, "queue_cleared");
        assert_eq!(anomaly.severity, AnomalySeverity::Warning);
    }

    // Invariant 1: attempt_count never exceeds effective_max_attempts,
    // even after repeated nack/requeue cycles.
    #[tokio::test]
    async fn invariant_attempt_count_bounded() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();

        for consumer in ["c1", "c2", "c3"] {
            let claimed = dequeue_one(&engine, "orders", consumer).await;
            assert!(claimed.message.attempt_count <= 3);
            engine.nack("orders", id, claimed.message.lock_token.unwrap(), consumer, None).await.unwrap();
        }

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Dead);
        assert!(m.attempt_count <= 3);
    }

    // Invariant 2: status=processing implies consumer_id, lock_token and
    // locked_until are all populated; they are all cleared the moment the
    // message leaves processing.
    #[tokio::test]
    async fn invariant_processing_fields_consistent() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        let claimed = dequeue_one(&engine, "orders", "c1").await;
        assert_eq!(claimed.message.status, MessageStatus::Processing);
        assert!(claimed.message.consumer_id.is_some());
        assert!(claimed.message.lock_token.is_some());
        assert!(claimed.message.locked_until.is_some());

        engine.acknowledge("orders", id, claimed.message.lock_token.unwrap(), "c1").await.unwrap();
        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Acknowledged);
        assert!(m.consumer_id.is_none());
        assert!(m.lock_token.is_none());
        assert!(m.locked_until.is_none());
    }

    // Invariant 4: ack is not idempotent against a reused lock token — the
    // second attempt (after the lock has already been cleared) reports
    // LockMismatch and leaves the already-acknowledged state untouched.
    #[tokio::test]
    async fn invariant_ack_idempotence() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        let claimed = dequeue_one(&engine, "orders", "c1").await;
        let token = claimed.message.lock_token.unwrap();

        engine.acknowledge("orders", id, token, "c1").await.unwrap();
        let err = engine.acknowledge("orders", id, token, "c1").await.unwrap_err();
        assert!(matches!(err, BrokerError::LockMismatch { message_id } if message_id == id));

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Acknowledged);
    }

    // Invariant 5: export -> clear -> import restores the queued set, and a
    // message reconstructed from a processing snapshot is imported queued.
    #[tokio::test]
    async fn invariant_export_clear_import_round_trip() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        for i in 0..5 {
            engine.enqueue("orders", format!("msg-{i}").into_bytes(), EnqueueOptions::default()).await.unwrap();
        }
        let claimed = dequeue_one(&engine, "orders", "c1").await;
        assert_eq!(claimed.message.status, MessageStatus::Processing);

        let exported = engine.export_messages("orders").await.unwrap();
        assert_eq!(exported.len(), 4);
        assert!(exported.iter().all(|m| m.status == MessageStatus::Queued));

        let mut snapshot = claimed.message.clone();
        snapshot.status = MessageStatus::Processing;
        let mut to_import = exported.clone();
        to_import.push(snapshot);

        engine.clear_queue("orders", None).await.unwrap();
        assert_eq!(engine.queue_depth("orders").await.unwrap().queued, 0);

        let imported_ids = engine.import_messages("orders", to_import).await.unwrap();
        assert_eq!(imported_ids.len(), 5);

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let restored: Vec<_> = msgs.iter().filter(|m| imported_ids.contains(&m.id)).collect();
        assert_eq!(restored.len(), 5);
        assert!(restored.iter().all(|m| m.status == MessageStatus::Queued));
        assert!(restored.iter().all(|m| m.consumer_id.is_none() && m.lock_token.is_none()));
    }

    // Invariant 6: running the reaper twice at the same instant is a no-op
    // the second time — no new activity, no further state change.
    #[tokio::test]
    async fn invariant_reaper_idempotent() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();
        dequeue_one(&engine, "orders", "c1").await;

        let future = Utc::now() + Duration::seconds(60);
        let first = engine.gateway().reap_expired(future, "reaper").await.unwrap();
        assert_eq!(first.len(), 1);

        let activity_after_first = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap().len();

        let second = engine.gateway().reap_expired(future, "reaper").await.unwrap();
        assert!(second.is_empty());

        let activity_after_second = engine.gateway().list_activity(Default::default(), duramq_storage::Pagination { limit: 100, offset: 0 }).await.unwrap().len();
        assert_eq!(activity_after_first, activity_after_second);
    }

    // Sanity check for the queue-name validator wired into AdminApi: the
    // engine itself never creates queues with invalid names, so this
    // exercises the gateway directly to confirm move/clear semantics hold
    // for an unrelated status filter target.
    #[tokio::test]
    async fn move_messages_by_status_filter() {
        let engine = test_engine();
        make_queue(&engine, "orders", 3).await;
        make_queue(&engine, "orders_archive", 3).await;
        let id = engine.enqueue("orders", b"hi".to_vec(), EnqueueOptions::default()).await.unwrap();

        let outcome = engine
            .move_messages(
                MoveTarget::StatusFilter { queue: "orders".into(), status: MessageStatus::Queued },
                MessageStatus::Archived,
                Some("orders_archive".into()),
                "orders",
            )
            .await
            .unwrap();
        assert_eq!(outcome.affected_count, 1);

        let msgs = engine.list_messages(Default::default(), Default::default()).await.unwrap();
        let m = msgs.iter().find(|m| m.id == id).unwrap();
        assert_eq!(m.status, MessageStatus::Archived);
        assert_eq!(m.queue, "orders_archive");
    }
}
