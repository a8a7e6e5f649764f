//! In-memory `StorageGateway`, used by engine unit tests so lifecycle and
//! invariant tests run without a live Postgres instance — mirroring how the
//! teacher workspace tests its queue engine against an in-memory consumer
//! fake rather than a real SQS queue.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use duramq_core::{
    ActivityAction, ActivityLogEntry, Anomaly, AnomalySeverity, Message, MessageId, MessageStatus, Queue, QueueDepth,
    QueueEvent,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StorageError;
use crate::gateway::StorageGateway;
use crate::types::*;

const EVENT_BUS_CAPACITY: usize = 1024;

struct Inner {
    queues: HashMap<String, Queue>,
    messages: HashMap<MessageId, Message>,
    activity: Vec<ActivityLogEntry>,
}

pub struct InMemoryStorageGateway {
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl Default for InMemoryStorageGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorageGateway {
    pub fn new() -> Self {
        let (events_tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Mutex::new(Inner { queues: HashMap::new(), messages: HashMap::new(), activity: Vec::new() }),
            events_tx,
        }
    }

    fn base_entry(triggered_by: &str, action: ActivityAction, queue: &str) -> ActivityLogEntry {
        ActivityLogEntry {
            log_id: Uuid::new_v4(),
            message_id: None,
            action,
            timestamp: Utc::now(),
            queue: queue.to_string(),
            source_queue: None,
            dest_queue: None,
            priority: None,
            message_type: None,
            consumer_id: None,
            prev_consumer_id: None,
            lock_token: None,
            prev_lock_token: None,
            attempt_count: None,
            max_attempts: None,
            attempts_remaining: None,
            message_created_at: None,
            message_age_ms: None,
            time_in_queue_ms: None,
            processing_time_ms: None,
            total_processing_time_ms: None,
            payload_size_bytes: None,
            queue_depth: None,
            processing_depth: None,
            dlq_depth: None,
            error_reason: None,
            error_code: None,
            triggered_by: triggered_by.to_string(),
            user_id: None,
            reason: None,
            batch_id: None,
            batch_size: None,
            prev_action: None,
            prev_timestamp: None,
            payload_snapshot: None,
            anomaly: None,
        }
    }

    fn depth_locked(inner: &Inner, queue: &str) -> QueueDepth {
        let mut d = QueueDepth::default();
        for m in inner.messages.values().filter(|m| m.queue == queue) {
            match m.status {
                MessageStatus::Queued => d.queued += 1,
                MessageStatus::Processing => d.processing += 1,
                MessageStatus::Dead => d.dead += 1,
                MessageStatus::Archived => d.archived += 1,
                MessageStatus::Acknowledged => {}
            }
        }
        d
    }

    fn publish(&self, event: QueueEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl StorageGateway for InMemoryStorageGateway {
    async fn create_queue(&self, queue: NewQueue) -> Result<Queue, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queues.contains_key(&queue.name) {
            return Err(StorageError::UniqueViolation(format!("queue {} already exists", queue.name)));
        }
        let now = Utc::now();
        let q = Queue {
            name: queue.name.clone(),
            queue_type: queue.queue_type,
            ack_timeout_seconds: queue.ack_timeout_seconds,
            max_attempts: queue.max_attempts,
            partition_interval: queue.partition_interval,
            retention_interval: queue.retention_interval,
            description: queue.description,
            created_at: now,
            updated_at: now,
        };
        inner.queues.insert(queue.name, q.clone());
        Ok(q)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StorageError> {
        Ok(self.inner.lock().unwrap().queues.get(name).cloned())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<Queue> = inner.queues.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(v)
    }

    async fn update_queue(&self, name: &str, patch: QueuePatch) -> Result<Queue, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner.queues.get_mut(name).ok_or_else(|| StorageError::QueueNotFound(name.to_string()))?;
        if let Some(v) = patch.ack_timeout_seconds {
            q.ack_timeout_seconds = v;
        }
        if let Some(v) = patch.max_attempts {
            q.max_attempts = v;
        }
        if let Some(v) = patch.retention_interval {
            q.retention_interval = v;
        }
        if let Some(v) = patch.description {
            q.description = v;
        }
        q.updated_at = Utc::now();
        Ok(q.clone())
    }

    async fn rename_queue(&self, old_name: &str, new_name: &str) -> Result<Queue, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let mut q = inner.queues.remove(old_name).ok_or_else(|| StorageError::QueueNotFound(old_name.to_string()))?;
        q.name = new_name.to_string();
        q.updated_at = Utc::now();
        inner.queues.insert(new_name.to_string(), q.clone());
        for m in inner.messages.values_mut().filter(|m| m.queue == old_name) {
            m.queue = new_name.to_string();
        }
        for a in inner.activity.iter_mut().filter(|a| a.queue == old_name) {
            a.queue = new_name.to_string();
        }
        Ok(q)
    }

    async fn delete_queue(&self, name: &str, force: bool) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queues.contains_key(name) {
            return Err(StorageError::QueueNotFound(name.to_string()));
        }
        let has_messages = inner.messages.values().any(|m| m.queue == name);
        if has_messages && !force {
            return Err(StorageError::QueueNotEmpty(name.to_string()));
        }
        inner.messages.retain(|_, m| m.queue != name);
        inner.queues.remove(name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner.messages.retain(|_, m| m.queue != name);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::depth_locked(&inner, name))
    }

    async fn enqueue_one(&self, msg: NewMessage, triggered_by: &str) -> Result<MessageId, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queues.contains_key(&msg.queue) {
            return Err(StorageError::QueueNotFound(msg.queue));
        }
        let id = msg.id;
        let priority = Message::clamp_priority(msg.priority);
        let now = Utc::now();
        let message = Message {
            id,
            queue: msg.queue.clone(),
            message_type: msg.message_type.clone(),
            priority,
            payload_size: msg.payload.len() as u64,
            payload: msg.payload,
            status: MessageStatus::Queued,
            attempt_count: 0,
            custom_max_attempts: msg.custom_max_attempts,
            custom_ack_timeout_seconds: msg.custom_ack_timeout_seconds,
            consumer_id: None,
            lock_token: None,
            locked_at: None,
            locked_until: None,
            created_at: now,
            acknowledged_at: None,
            error_reason: None,
            prev_consumer_id: None,
            prev_lock_token: None,
        };
        inner.messages.insert(id, message);

        let depth = Self::depth_locked(&inner, &msg.queue);
        let mut entry = Self::base_entry(triggered_by, ActivityAction::Enqueue, &msg.queue);
        entry.message_id = Some(id);
        entry.priority = Some(priority);
        entry.message_type = msg.message_type;
        entry.queue_depth = Some(depth.queued);
        entry.processing_depth = Some(depth.processing);
        entry.dlq_depth = Some(depth.dead);
        inner.activity.push(entry);
        drop(inner);

        self.publish(QueueEvent { queue: msg.queue, action: ActivityAction::Enqueue, message_id: Some(id), timestamp: now });
        Ok(id)
    }

    async fn enqueue_batch(&self, msgs: Vec<NewMessage>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        let queue = msgs[0].queue.clone();
        let mut ids = Vec::with_capacity(msgs.len());
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.queues.contains_key(&queue) {
                return Err(StorageError::QueueNotFound(queue));
            }
            let now = Utc::now();
            for msg in msgs {
                let id = msg.id;
                let priority = Message::clamp_priority(msg.priority);
                let message = Message {
                    id,
                    queue: msg.queue.clone(),
                    message_type: msg.message_type,
                    priority,
                    payload_size: msg.payload.len() as u64,
                    payload: msg.payload,
                    status: MessageStatus::Queued,
                    attempt_count: 0,
                    custom_max_attempts: msg.custom_max_attempts,
                    custom_ack_timeout_seconds: msg.custom_ack_timeout_seconds,
                    consumer_id: None,
                    lock_token: None,
                    locked_at: None,
                    locked_until: None,
                    created_at: now,
                    acknowledged_at: None,
                    error_reason: None,
                    prev_consumer_id: None,
                    prev_lock_token: None,
                };
                inner.messages.insert(id, message);
                ids.push(id);
            }
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Enqueue, &queue);
            entry.batch_id = Some(Uuid::new_v4());
            entry.batch_size = Some(ids.len() as u32);
            inner.activity.push(entry);
        }
        self.publish(QueueEvent { queue, action: ActivityAction::Enqueue, message_id: None, timestamp: Utc::now() });
        Ok(ids)
    }

    async fn dequeue_claim(
        &self,
        queue: &str,
        count: u32,
        consumer_id: &str,
        type_filter: Option<&str>,
        ack_timeout: Duration,
        triggered_by: &str,
    ) -> Result<Vec<ClaimedMessage>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let mut candidates: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| {
                m.queue == queue
                    && m.status == MessageStatus::Queued
                    && type_filter.map(|t| m.message_type.as_deref() == Some(t)).unwrap_or(true)
            })
            .map(|m| m.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ma = &inner.messages[a];
            let mb = &inner.messages[b];
            mb.priority.cmp(&ma.priority).then(ma.created_at.cmp(&mb.created_at))
        });
        candidates.truncate(count as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            let token = Uuid::new_v4();
            let (time_in_queue_ms, queue_name, priority, message_type, attempt_count, created_at, payload_size) = {
                let m = inner.messages.get_mut(&id).unwrap();
                m.status = MessageStatus::Processing;
                m.consumer_id = Some(consumer_id.to_string());
                m.lock_token = Some(token);
                m.locked_at = Some(now);
                m.locked_until = Some(now + ack_timeout);
                m.attempt_count += 1;
                (
                    (now - m.created_at).num_milliseconds(),
                    m.queue.clone(),
                    m.priority,
                    m.message_type.clone(),
                    m.attempt_count,
                    m.created_at,
                    m.payload_size,
                )
            };

            let mut entry = Self::base_entry(triggered_by, ActivityAction::Dequeue, &queue_name);
            entry.message_id = Some(id);
            entry.consumer_id = Some(consumer_id.to_string());
            entry.lock_token = Some(token);
            entry.priority = Some(priority);
            entry.message_type = message_type;
            entry.attempt_count = Some(attempt_count);
            entry.time_in_queue_ms = Some(time_in_queue_ms);
            entry.message_created_at = Some(created_at);
            entry.payload_size_bytes = Some(payload_size);
            let log_id = entry.log_id;
            inner.activity.push(entry);

            claimed.push(ClaimedMessage { message: inner.messages[&id].clone(), time_in_queue_ms, log_id });
        }
        drop(inner);

        for c in &claimed {
            self.publish(QueueEvent {
                queue: queue.to_string(),
                action: ActivityAction::Dequeue,
                message_id: Some(c.message.id),
                timestamp: Utc::now(),
            });
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, req: AckRequest, triggered_by: &str) -> Result<AckOutcome, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.messages.get(&req.message_id).cloned().ok_or(StorageError::MessageNotFound(req.message_id))?;

        if message.lock_token != Some(req.lock_token) {
            let anomaly = Anomaly {
                anomaly_type: "lock_stolen".to_string(),
                severity: AnomalySeverity::Critical,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({
                    "expected_lock_token": message.lock_token,
                    "received_lock_token": req.lock_token,
                }),
            };
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Ack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.anomaly = Some(anomaly.clone());
            let log_id = entry.log_id;
            inner.activity.push(entry);
            return Ok(AckOutcome::LockMismatch { log_id, anomaly });
        }

        let now = Utc::now();
        let processing_time_ms = message.locked_at.map(|l| (now - l).num_milliseconds()).unwrap_or(0);
        {
            let m = inner.messages.get_mut(&req.message_id).unwrap();
            m.status = MessageStatus::Acknowledged;
            m.acknowledged_at = Some(now);
            m.consumer_id = None;
            m.lock_token = None;
            m.locked_at = None;
            m.locked_until = None;
        }

        let mut entry = Self::base_entry(triggered_by, ActivityAction::Ack, &message.queue);
        entry.message_id = Some(req.message_id);
        entry.consumer_id = Some(req.consumer_id.clone());
        entry.processing_time_ms = Some(processing_time_ms);
        entry.attempt_count = Some(message.attempt_count);
        let log_id = entry.log_id;
        inner.activity.push(entry);
        drop(inner);

        self.publish(QueueEvent { queue: message.queue, action: ActivityAction::Ack, message_id: Some(req.message_id), timestamp: now });
        Ok(AckOutcome::Acknowledged { log_id, processing_time_ms })
    }

    async fn nack(&self, req: NackRequest, triggered_by: &str) -> Result<NackOutcome, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner.messages.get(&req.message_id).cloned().ok_or(StorageError::MessageNotFound(req.message_id))?;

        if message.lock_token != Some(req.lock_token) {
            let anomaly = Anomaly {
                anomaly_type: "lock_stolen".to_string(),
                severity: AnomalySeverity::Critical,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({
                    "expected_lock_token": message.lock_token,
                    "received_lock_token": req.lock_token,
                }),
            };
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Nack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.anomaly = Some(anomaly.clone());
            let log_id = entry.log_id;
            inner.activity.push(entry);
            return Ok(NackOutcome::LockMismatch { log_id, anomaly });
        }

        let queue = inner.queues.get(&message.queue).cloned().ok_or_else(|| StorageError::QueueNotFound(message.queue.clone()))?;
        let max_attempts = message.effective_max_attempts(&queue);

        if message.attempt_count < max_attempts {
            {
                let m = inner.messages.get_mut(&req.message_id).unwrap();
                m.status = MessageStatus::Queued;
                m.consumer_id = None;
                m.lock_token = None;
                m.locked_at = None;
                m.locked_until = None;
                m.error_reason = req.reason.clone();
            }
            let attempts_remaining = max_attempts - message.attempt_count;
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Nack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.consumer_id = Some(req.consumer_id.clone());
            entry.attempt_count = Some(message.attempt_count);
            entry.max_attempts = Some(max_attempts);
            entry.attempts_remaining = Some(attempts_remaining);
            entry.error_reason = req.reason.clone();
            let log_id = entry.log_id;
            inner.activity.push(entry);
            drop(inner);

            self.publish(QueueEvent { queue: message.queue, action: ActivityAction::Nack, message_id: Some(req.message_id), timestamp: Utc::now() });
            Ok(NackOutcome::Requeued { log_id, attempts_remaining })
        } else {
            {
                let m = inner.messages.get_mut(&req.message_id).unwrap();
                m.status = MessageStatus::Dead;
                m.consumer_id = None;
                m.lock_token = None;
                m.locked_at = None;
                m.locked_until = None;
                m.error_reason = req.reason.clone();
            }
            let anomaly = Anomaly {
                anomaly_type: "dlq_movement".to_string(),
                severity: AnomalySeverity::Warning,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({ "attempt_count": message.attempt_count, "max_attempts": max_attempts }),
            };
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Dlq, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.attempt_count = Some(message.attempt_count);
            entry.max_attempts = Some(max_attempts);
            entry.anomaly = Some(anomaly.clone());
            let log_id = entry.log_id;
            inner.activity.push(entry);
            drop(inner);

            self.publish(QueueEvent { queue: message.queue, action: ActivityAction::Dlq, message_id: Some(req.message_id), timestamp: Utc::now() });
            Ok(NackOutcome::DeadLettered { log_id, anomaly })
        }
    }

    async fn touch(&self, req: TouchRequest, ack_timeout: Duration) -> Result<TouchOutcome, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let m = inner.messages.get_mut(&req.message_id).ok_or(StorageError::MessageNotFound(req.message_id))?;
        if m.lock_token != Some(req.lock_token) || m.status != MessageStatus::Processing {
            return Ok(TouchOutcome::LockMismatch);
        }
        let locked_until = Utc::now() + ack_timeout;
        m.locked_until = Some(locked_until);
        let queue = m.queue.clone();
        let mut entry = Self::base_entry("system", ActivityAction::Touch, &queue);
        entry.message_id = Some(req.message_id);
        entry.lock_token = Some(req.lock_token);
        inner.activity.push(entry);
        Ok(TouchOutcome::Extended { locked_until })
    }

    async fn reap_expired(&self, now: DateTime<Utc>, triggered_by: &str) -> Result<Vec<ReapOutcome>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Processing && m.locked_until.map(|lu| lu < now).unwrap_or(false))
            .map(|m| m.id)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            let message = inner.messages[&id].clone();
            let queue = inner.queues.get(&message.queue).cloned().ok_or_else(|| StorageError::QueueNotFound(message.queue.clone()))?;
            let max_attempts = message.effective_max_attempts(&queue);
            let expected_timeout_ms = message.effective_ack_timeout(&queue).num_milliseconds();
            let overdue_ms = message.locked_until.map(|lu| (now - lu).num_milliseconds()).unwrap_or(0);
            let prev_consumer_id = message.consumer_id.clone();
            let requeued = message.attempt_count < max_attempts;

            {
                let m = inner.messages.get_mut(&id).unwrap();
                m.status = if requeued { MessageStatus::Queued } else { MessageStatus::Dead };
                m.prev_consumer_id = prev_consumer_id.clone();
                m.prev_lock_token = m.lock_token;
                m.consumer_id = None;
                m.lock_token = None;
                m.locked_at = None;
                m.locked_until = None;
            }

            let zombie_anomaly = if overdue_ms as f64 > expected_timeout_ms as f64 * 3.0 {
                Some(Anomaly {
                    anomaly_type: "zombie_message".to_string(),
                    severity: AnomalySeverity::Critical,
                    message_id: Some(id),
                    consumer_id: prev_consumer_id.clone(),
                    details: serde_json::json!({ "overdue_ms": overdue_ms, "expected_timeout_ms": expected_timeout_ms }),
                })
            } else {
                None
            };

            let action = if requeued { ActivityAction::Timeout } else { ActivityAction::Dlq };
            let mut entry = Self::base_entry(triggered_by, action, &message.queue);
            entry.message_id = Some(id);
            entry.prev_consumer_id = prev_consumer_id.clone();
            entry.attempt_count = Some(message.attempt_count);
            entry.max_attempts = Some(max_attempts);
            entry.anomaly = zombie_anomaly.clone();
            inner.activity.push(entry);

            outcomes.push(ReapOutcome { message_id: id, prev_consumer_id, requeued, zombie_anomaly });
        }
        drop(inner);
        Ok(outcomes)
    }

    async fn move_messages(&self, req: MoveRequest) -> Result<MoveOutcome, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<MessageId> = match &req.target {
            MoveTarget::Ids(ids) => ids.clone(),
            MoveTarget::StatusFilter { queue, status } => {
                inner.messages.values().filter(|m| &m.queue == queue && m.status == *status).map(|m| m.id).collect()
            }
        };
        let batch_id = Uuid::new_v4();
        let mut source_queue = None;
        for id in &ids {
            if let Some(m) = inner.messages.get_mut(id) {
                source_queue.get_or_insert_with(|| m.queue.clone());
                m.status = req.dest_status;
                if let Some(dest) = &req.dest_queue {
                    m.queue = dest.clone();
                }
            }
        }
        let affected_count = ids.len() as u64;
        if affected_count > 0 {
            let mut entry = Self::base_entry(&req.triggered_by, ActivityAction::Move, source_queue.as_deref().unwrap_or(""));
            entry.batch_id = Some(batch_id);
            entry.batch_size = Some(affected_count as u32);
            entry.source_queue = source_queue;
            entry.dest_queue = req.dest_queue;
            inner.activity.push(entry);
        }
        Ok(MoveOutcome { batch_id, affected_count })
    }

    async fn delete_messages(&self, ids: Vec<MessageId>, triggered_by: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0u64;
        for id in ids {
            if let Some(m) = inner.messages.remove(&id) {
                let mut entry = Self::base_entry(triggered_by, ActivityAction::Delete, &m.queue);
                entry.message_id = Some(id);
                inner.activity.push(entry);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn clear_queue(&self, queue: &str, status: Option<MessageStatus>, triggered_by: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner.messages.retain(|_, m| !(m.queue == queue && status.map(|s| m.status == s).unwrap_or(true)));
        let affected = (before - inner.messages.len()) as u64;
        if affected > 0 {
            let anomaly = Anomaly {
                anomaly_type: "queue_cleared".to_string(),
                severity: AnomalySeverity::Warning,
                message_id: None,
                consumer_id: None,
                details: serde_json::json!({ "affected_count": affected }),
            };
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Clear, queue);
            entry.batch_size = Some(affected as u32);
            entry.anomaly = Some(anomaly);
            inner.activity.push(entry);
        }
        Ok(affected)
    }

    async fn list_messages(&self, filter: MessageFilter, page: Pagination) -> Result<Vec<Message>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| filter.queue.as_deref().map(|q| m.queue == q).unwrap_or(true))
            .filter(|m| filter.status.map(|s| m.status == s).unwrap_or(true))
            .filter(|m| filter.message_type.as_deref().map(|t| m.message_type.as_deref() == Some(t)).unwrap_or(true))
            .cloned()
            .collect();
        v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(v.into_iter().skip(page.offset as usize).take(page.limit as usize).collect())
    }

    async fn export_messages(&self, queue: &str) -> Result<Vec<Message>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<Message> =
            inner.messages.values().filter(|m| m.queue == queue && m.status == MessageStatus::Queued).cloned().collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(v)
    }

    async fn import_messages(&self, queue: &str, messages: Vec<Message>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids = Vec::with_capacity(messages.len());
        for mut m in messages {
            m.id = Uuid::new_v4();
            m.queue = queue.to_string();
            m.status = MessageStatus::Queued;
            m.consumer_id = None;
            m.lock_token = None;
            m.locked_at = None;
            m.locked_until = None;
            ids.push(m.id);
            inner.messages.insert(m.id, m);
        }
        if !ids.is_empty() {
            let mut entry = Self::base_entry(triggered_by, ActivityAction::Enqueue, queue);
            entry.batch_id = Some(Uuid::new_v4());
            entry.batch_size = Some(ids.len() as u32);
            inner.activity.push(entry);
        }
        Ok(ids)
    }

    async fn list_activity(&self, filter: ActivityFilter, page: Pagination) -> Result<Vec<ActivityLogEntry>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut v: Vec<ActivityLogEntry> = inner
            .activity
            .iter()
            .filter(|a| filter.queue.as_deref().map(|q| a.queue == q).unwrap_or(true))
            .filter(|a| filter.action.map(|act| a.action == act).unwrap_or(true))
            .filter(|a| filter.message_id.map(|id| a.message_id == Some(id)).unwrap_or(true))
            .cloned()
            .collect();
        v.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(v.into_iter().skip(page.offset as usize).take(page.limit as usize).collect())
    }

    async fn attach_anomaly(&self, log_id: Uuid, anomaly: Anomaly) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.activity.iter_mut().find(|a| a.log_id == log_id) {
            entry.anomaly = Some(anomaly);
        }
        Ok(())
    }

    async fn notify(&self, payload: &QueueEvent) -> Result<(), StorageError> {
        self.publish(payload.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_queue(name: &str) -> NewQueue {
        NewQueue {
            name: name.to_string(),
            queue_type: duramq_core::QueueType::Standard,
            ack_timeout_seconds: 30,
            max_attempts: 3,
            partition_interval: None,
            retention_interval: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_claims_message() {
        let gw = InMemoryStorageGateway::new();
        gw.create_queue(new_queue("orders")).await.unwrap();
        gw.enqueue_one(
            NewMessage { id: Uuid::new_v4(), queue: "orders".into(), message_type: None, priority: 0, payload: b"{}".to_vec(), custom_max_attempts: None, custom_ack_timeout_seconds: None },
            "test",
        )
        .await
        .unwrap();

        let claimed = gw.dequeue_claim("orders", 1, "c1", None, Duration::seconds(30), "test").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message.status, MessageStatus::Processing);
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let gw = InMemoryStorageGateway::new();
        gw.create_queue(new_queue("orders")).await.unwrap();
        let a = NewMessage { id: Uuid::new_v4(), queue: "orders".into(), message_type: None, priority: 0, payload: vec![], custom_max_attempts: None, custom_ack_timeout_seconds: None };
        let b = NewMessage { id: Uuid::new_v4(), priority: 9, ..a.clone() };
        let c = NewMessage { id: Uuid::new_v4(), priority: 0, ..a.clone() };
        let id_a = gw.enqueue_one(a, "t").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let id_b = gw.enqueue_one(b, "t").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let id_c = gw.enqueue_one(c, "t").await.unwrap();

        let claimed = gw.dequeue_claim("orders", 3, "c1", None, Duration::seconds(30), "t").await.unwrap();
        let ids: Vec<MessageId> = claimed.iter().map(|c| c.message.id).collect();
        assert_eq!(ids, vec![id_b, id_a, id_c]);
    }

    #[tokio::test]
    async fn ack_with_wrong_token_is_lock_mismatch() {
        let gw = InMemoryStorageGateway::new();
        gw.create_queue(new_queue("orders")).await.unwrap();
        gw.enqueue_one(
            NewMessage { id: Uuid::new_v4(), queue: "orders".into(), message_type: None, priority: 0, payload: vec![], custom_max_attempts: None, custom_ack_timeout_seconds: None },
            "t",
        )
        .await
        .unwrap();
        let claimed = gw.dequeue_claim("orders", 1, "c1", None, Duration::seconds(30), "t").await.unwrap();
        let id = claimed[0].message.id;

        let outcome = gw.acknowledge(AckRequest { message_id: id, lock_token: Uuid::new_v4(), consumer_id: "c1".into() }, "t").await.unwrap();
        assert!(matches!(outcome, AckOutcome::LockMismatch { .. }));
    }
}
