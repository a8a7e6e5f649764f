use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use duramq_core::{
    ActivityAction, ActivityLogEntry, Anomaly, Message, MessageId, MessageStatus, Queue, QueueDepth, QueueEvent,
};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::*;
use crate::error::StorageError;
use crate::gateway::StorageGateway;
use crate::types::*;

const EVENT_BUS_CAPACITY: usize = 1024;

pub struct PgStorageGateway {
    pool: PgPool,
    channel_name: String,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl PgStorageGateway {
    /// Connect and start the background LISTEN task. `channel_name` is the
    /// NOTIFY channel configured via `EventBusConfig` (default
    /// "queue_events").
    pub async fn connect(pool: PgPool, channel_name: impl Into<String>) -> Result<Self, StorageError> {
        let channel_name = channel_name.into();
        let (events_tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);

        spawn_listener(pool.clone(), channel_name.clone(), events_tx.clone());

        Ok(Self { pool, channel_name, events_tx })
    }

    fn activity_base(triggered_by: &str, action: ActivityAction, queue: &str) -> ActivityLogEntry {
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

    async fn insert_activity(tx: &mut Transaction<'_, Postgres>, e: &ActivityLogEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO activity_log (
                log_id, message_id, action, timestamp, queue, source_queue, dest_queue,
                priority, message_type, consumer_id, prev_consumer_id, lock_token, prev_lock_token,
                attempt_count, max_attempts, attempts_remaining, message_created_at, message_age_ms,
                time_in_queue_ms, processing_time_ms, total_processing_time_ms, payload_size_bytes,
                queue_depth, processing_depth, dlq_depth, error_reason, error_code, triggered_by,
                user_id, reason, batch_id, batch_size, prev_action, prev_timestamp, payload_snapshot, anomaly
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32, $33, $34, $35, $36
            )",
        )
        .bind(e.log_id)
        .bind(e.message_id)
        .bind(action_str(e.action))
        .bind(e.timestamp)
        .bind(&e.queue)
        .bind(&e.source_queue)
        .bind(&e.dest_queue)
        .bind(e.priority.map(|p| p as i16))
        .bind(&e.message_type)
        .bind(&e.consumer_id)
        .bind(&e.prev_consumer_id)
        .bind(e.lock_token)
        .bind(e.prev_lock_token)
        .bind(e.attempt_count.map(|v| v as i32))
        .bind(e.max_attempts.map(|v| v as i32))
        .bind(e.attempts_remaining.map(|v| v as i32))
        .bind(e.message_created_at)
        .bind(e.message_age_ms)
        .bind(e.time_in_queue_ms)
        .bind(e.processing_time_ms)
        .bind(e.total_processing_time_ms)
        .bind(e.payload_size_bytes.map(|v| v as i64))
        .bind(e.queue_depth)
        .bind(e.processing_depth)
        .bind(e.dlq_depth)
        .bind(&e.error_reason)
        .bind(&e.error_code)
        .bind(&e.triggered_by)
        .bind(&e.user_id)
        .bind(&e.reason)
        .bind(e.batch_id)
        .bind(e.batch_size.map(|v| v as i32))
        .bind(e.prev_action.map(action_str))
        .bind(e.prev_timestamp)
        .bind(&e.payload_snapshot)
        .bind(e.anomaly.as_ref().map(|a| serde_json::to_value(a).unwrap_or_default()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn depth_snapshot(tx: &mut Transaction<'_, Postgres>, queue: &str) -> Result<(i64, i64, i64), sqlx::Error> {
        let row = sqlx::query(
            "SELECT
                count(*) FILTER (WHERE status = 'queued') AS queued,
                count(*) FILTER (WHERE status = 'processing') AS processing,
                count(*) FILTER (WHERE status = 'dead') AS dead
             FROM messages WHERE queue = $1",
        )
        .bind(queue)
        .fetch_one(&mut **tx)
        .await?;
        Ok((row.try_get("queued")?, row.try_get("processing")?, row.try_get("dead")?))
    }
}

fn spawn_listener(pool: PgPool, channel_name: String, tx: broadcast::Sender<QueueEvent>) {
    tokio::spawn(async move {
        loop {
            match PgListener::connect_with(&pool).await {
                Ok(mut listener) => {
                    if let Err(e) = listener.listen(&channel_name).await {
                        warn!("failed to LISTEN on {}: {}", channel_name, e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                    info!("listening for events on channel {}", channel_name);
                    loop {
                        match listener.recv().await {
                            Ok(notification) => {
                                match serde_json::from_str::<QueueEvent>(notification.payload()) {
                                    Ok(event) => {
                                        let _ = tx.send(event);
                                    }
                                    Err(e) => warn!("malformed event payload: {}", e),
                                }
                            }
                            Err(e) => {
                                warn!("LISTEN connection dropped: {}, reconnecting", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to open LISTEN connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    });
}

fn row_to_queue(row: &sqlx::postgres::PgRow) -> Result<Queue, sqlx::Error> {
    let queue_type: String = row.try_get("queue_type")?;
    let partition_interval: Option<String> = row.try_get("partition_interval")?;
    let retention_seconds: Option<i64> = row.try_get("retention_interval_seconds")?;
    Ok(Queue {
        name: row.try_get("name")?,
        queue_type: parse_queue_type(&queue_type),
        ack_timeout_seconds: row.try_get::<i32, _>("ack_timeout_seconds")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        partition_interval: partition_interval.as_deref().and_then(parse_partition_interval),
        retention_interval: retention_seconds.map(Duration::seconds),
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Message {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        message_type: row.try_get("message_type")?,
        priority: row.try_get::<i16, _>("priority")? as u8,
        payload: row.try_get("payload")?,
        payload_size: row.try_get::<i64, _>("payload_size")? as u64,
        status: parse_status(&status),
        attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
        custom_max_attempts: row.try_get::<Option<i32>, _>("custom_max_attempts")?.map(|v| v as u32),
        custom_ack_timeout_seconds: row
            .try_get::<Option<i32>, _>("custom_ack_timeout_seconds")?
            .map(|v| v as u32),
        consumer_id: row.try_get("consumer_id")?,
        lock_token: row.try_get("lock_token")?,
        locked_at: row.try_get("locked_at")?,
        locked_until: row.try_get("locked_until")?,
        created_at: row.try_get("created_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        error_reason: row.try_get("error_reason")?,
        prev_consumer_id: row.try_get("prev_consumer_id")?,
        prev_lock_token: row.try_get("prev_lock_token")?,
    })
}

#[async_trait]
impl StorageGateway for PgStorageGateway {
    async fn create_queue(&self, queue: NewQueue) -> Result<Queue, StorageError> {
        let row = sqlx::query(
            "INSERT INTO queues (name, queue_type, ack_timeout_seconds, max_attempts,
                partition_interval, retention_interval_seconds, description)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(&queue.name)
        .bind(queue_type_str(queue.queue_type))
        .bind(queue.ack_timeout_seconds as i32)
        .bind(queue.max_attempts as i32)
        .bind(queue.partition_interval.map(partition_interval_str))
        .bind(queue.retention_interval.map(|d| d.num_seconds()))
        .bind(&queue.description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StorageError::UniqueViolation(format!("queue {} already exists", queue.name))
            }
            _ => StorageError::Database(e),
        })?;
        Ok(row_to_queue(&row)?)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StorageError> {
        let row = sqlx::query("SELECT * FROM queues WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_queue).transpose()?)
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, StorageError> {
        let rows = sqlx::query("SELECT * FROM queues ORDER BY name").fetch_all(&self.pool).await?;
        rows.iter().map(|r| row_to_queue(r).map_err(StorageError::from)).collect()
    }

    async fn update_queue(&self, name: &str, patch: QueuePatch) -> Result<Queue, StorageError> {
        let current = self
            .get_queue(name)
            .await?
            .ok_or_else(|| StorageError::QueueNotFound(name.to_string()))?;

        let ack_timeout = patch.ack_timeout_seconds.unwrap_or(current.ack_timeout_seconds);
        let max_attempts = patch.max_attempts.unwrap_or(current.max_attempts);
        let retention = patch.retention_interval.unwrap_or(current.retention_interval);
        let description = patch.description.unwrap_or(current.description);

        let row = sqlx::query(
            "UPDATE queues SET ack_timeout_seconds = $2, max_attempts = $3,
                retention_interval_seconds = $4, description = $5, updated_at = now()
             WHERE name = $1 RETURNING *",
        )
        .bind(name)
        .bind(ack_timeout as i32)
        .bind(max_attempts as i32)
        .bind(retention.map(|d| d.num_seconds()))
        .bind(&description)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_queue(&row)?)
    }

    async fn rename_queue(&self, old_name: &str, new_name: &str) -> Result<Queue, StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET queue = $2 WHERE queue = $1")
            .bind(old_name)
            .bind(new_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE activity_log SET queue = $2 WHERE queue = $1")
            .bind(old_name)
            .bind(new_name)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("UPDATE queues SET name = $2, updated_at = now() WHERE name = $1 RETURNING *")
            .bind(old_name)
            .bind(new_name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::QueueNotFound(old_name.to_string()))?;
        tx.commit().await?;
        Ok(row_to_queue(&row)?)
    }

    async fn delete_queue(&self, name: &str, force: bool) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM messages WHERE queue = $1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 && !force {
            return Err(StorageError::QueueNotEmpty(name.to_string()));
        }
        if count > 0 {
            sqlx::query("DELETE FROM messages WHERE queue = $1").bind(name).execute(&mut *tx).await?;
        }
        let result = sqlx::query("DELETE FROM queues WHERE name = $1").bind(name).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::QueueNotFound(name.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM messages WHERE queue = $1").bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth, StorageError> {
        let row = sqlx::query(
            "SELECT
                count(*) FILTER (WHERE status = 'queued') AS queued,
                count(*) FILTER (WHERE status = 'processing') AS processing,
                count(*) FILTER (WHERE status = 'dead') AS dead,
                count(*) FILTER (WHERE status = 'archived') AS archived
             FROM messages WHERE queue = $1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueDepth {
            queued: row.try_get("queued")?,
            processing: row.try_get("processing")?,
            dead: row.try_get("dead")?,
            archived: row.try_get("archived")?,
        })
    }

    async fn enqueue_one(&self, msg: NewMessage, triggered_by: &str) -> Result<MessageId, StorageError> {
        let id = msg.id;
        let priority = Message::clamp_priority(msg.priority);
        let payload_size = msg.payload.len() as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO messages (id, queue, message_type, priority, payload, payload_size,
                status, custom_max_attempts, custom_ack_timeout_seconds)
             VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8)",
        )
        .bind(id)
        .bind(&msg.queue)
        .bind(&msg.message_type)
        .bind(priority as i16)
        .bind(&msg.payload)
        .bind(payload_size)
        .bind(msg.custom_max_attempts.map(|v| v as i32))
        .bind(msg.custom_ack_timeout_seconds.map(|v| v as i32))
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                StorageError::QueueNotFound(msg.queue.clone())
            }
            _ => StorageError::Database(e),
        })?;

        let mut entry = Self::activity_base(triggered_by, ActivityAction::Enqueue, &msg.queue);
        entry.message_id = Some(id);
        entry.priority = Some(priority);
        entry.message_type = msg.message_type.clone();
        entry.payload_size_bytes = Some(payload_size as u64);
        entry.message_created_at = Some(entry.timestamp);
        let (queued, processing, dead) = Self::depth_snapshot(&mut tx, &msg.queue).await?;
        entry.queue_depth = Some(queued);
        entry.processing_depth = Some(processing);
        entry.dlq_depth = Some(dead);
        Self::insert_activity(&mut tx, &entry).await?;

        tx.commit().await?;

        let _ = self
            .notify(&QueueEvent {
                queue: msg.queue.clone(),
                action: ActivityAction::Enqueue,
                message_id: Some(id),
                timestamp: entry.timestamp,
            })
            .await;
        Ok(id)
    }

    async fn enqueue_batch(&self, msgs: Vec<NewMessage>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        let queue = msgs[0].queue.clone();
        let mut ids = Vec::with_capacity(msgs.len());
        let mut tx = self.pool.begin().await?;

        for msg in &msgs {
            let id = msg.id;
            let priority = Message::clamp_priority(msg.priority);
            let payload_size = msg.payload.len() as i64;
            sqlx::query(
                "INSERT INTO messages (id, queue, message_type, priority, payload, payload_size,
                    status, custom_max_attempts, custom_ack_timeout_seconds)
                 VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8)",
            )
            .bind(id)
            .bind(&msg.queue)
            .bind(&msg.message_type)
            .bind(priority as i16)
            .bind(&msg.payload)
            .bind(payload_size)
            .bind(msg.custom_max_attempts.map(|v| v as i32))
            .bind(msg.custom_ack_timeout_seconds.map(|v| v as i32))
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        let mut entry = Self::activity_base(triggered_by, ActivityAction::Enqueue, &queue);
        entry.batch_id = Some(Uuid::new_v4());
        entry.batch_size = Some(msgs.len() as u32);
        let (queued, processing, dead) = Self::depth_snapshot(&mut tx, &queue).await?;
        entry.queue_depth = Some(queued);
        entry.processing_depth = Some(processing);
        entry.dlq_depth = Some(dead);
        Self::insert_activity(&mut tx, &entry).await?;
        tx.commit().await?;

        let _ = self
            .notify(&QueueEvent { queue, action: ActivityAction::Enqueue, message_id: None, timestamp: entry.timestamp })
            .await;
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
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let locked_until = now + ack_timeout;

        let rows = sqlx::query(
            "WITH claimed AS (
                SELECT id FROM messages
                WHERE queue = $1 AND status = 'queued'
                    AND ($2::text IS NULL OR message_type = $2)
                ORDER BY priority DESC, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE messages m
            SET status = 'processing', consumer_id = $4,
                locked_at = $5, locked_until = $6, attempt_count = attempt_count + 1
            FROM claimed WHERE m.id = claimed.id
            RETURNING m.*",
        )
        .bind(queue)
        .bind(type_filter)
        .bind(count as i64)
        .bind(consumer_id)
        .bind(now)
        .bind(locked_until)
        .fetch_all(&mut *tx)
        .await?;

        // Each claimed row needs its own lock_token, stamped individually
        // so concurrent ack/nack calls can't collide on a shared value.
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let msg_id: Uuid = row.try_get("id")?;
            let token = Uuid::new_v4();
            sqlx::query("UPDATE messages SET lock_token = $2 WHERE id = $1")
                .bind(msg_id)
                .bind(token)
                .execute(&mut *tx)
                .await?;
            let mut message = row_to_message(row)?;
            message.lock_token = Some(token);

            let time_in_queue_ms = (now - message.created_at).num_milliseconds();
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Dequeue, queue);
            entry.message_id = Some(message.id);
            entry.consumer_id = Some(consumer_id.to_string());
            entry.lock_token = Some(token);
            entry.priority = Some(message.priority);
            entry.message_type = message.message_type.clone();
            entry.attempt_count = Some(message.attempt_count);
            entry.time_in_queue_ms = Some(time_in_queue_ms);
            entry.message_created_at = Some(message.created_at);
            entry.payload_size_bytes = Some(message.payload_size);
            Self::insert_activity(&mut tx, &entry).await?;

            claimed.push(ClaimedMessage { message, time_in_queue_ms, log_id: entry.log_id });
        }

        tx.commit().await?;

        for c in &claimed {
            let _ = self
                .notify(&QueueEvent {
                    queue: queue.to_string(),
                    action: ActivityAction::Dequeue,
                    message_id: Some(c.message.id),
                    timestamp: Utc::now(),
                })
                .await;
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, req: AckRequest, triggered_by: &str) -> Result<AckOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1 FOR UPDATE")
            .bind(req.message_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StorageError::MessageNotFound(req.message_id))?;
        let message = row_to_message(&row)?;

        if message.lock_token != Some(req.lock_token) {
            let anomaly = Anomaly {
                anomaly_type: "lock_stolen".to_string(),
                severity: duramq_core::AnomalySeverity::Critical,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({
                    "expected_lock_token": message.lock_token,
                    "received_lock_token": req.lock_token,
                }),
            };
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Ack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.consumer_id = Some(req.consumer_id.clone());
            entry.lock_token = Some(req.lock_token);
            entry.anomaly = Some(anomaly.clone());
            Self::insert_activity(&mut tx, &entry).await?;
            tx.commit().await?;
            return Ok(AckOutcome::LockMismatch { log_id: entry.log_id, anomaly });
        }

        let now = Utc::now();
        let processing_time_ms = message.locked_at.map(|l| (now - l).num_milliseconds()).unwrap_or(0);
        sqlx::query(
            "UPDATE messages SET status = 'acknowledged', acknowledged_at = $2,
                consumer_id = NULL, lock_token = NULL, locked_at = NULL, locked_until = NULL WHERE id = $1",
        )
        .bind(req.message_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut entry = Self::activity_base(triggered_by, ActivityAction::Ack, &message.queue);
        entry.message_id = Some(req.message_id);
        entry.consumer_id = Some(req.consumer_id.clone());
        entry.lock_token = Some(req.lock_token);
        entry.processing_time_ms = Some(processing_time_ms);
        entry.attempt_count = Some(message.attempt_count);
        Self::insert_activity(&mut tx, &entry).await?;
        tx.commit().await?;

        let _ = self
            .notify(&QueueEvent {
                queue: message.queue.clone(),
                action: ActivityAction::Ack,
                message_id: Some(req.message_id),
                timestamp: now,
            })
            .await;
        Ok(AckOutcome::Acknowledged { log_id: entry.log_id, processing_time_ms })
    }

    async fn nack(&self, req: NackRequest, triggered_by: &str) -> Result<NackOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1 FOR UPDATE")
            .bind(req.message_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StorageError::MessageNotFound(req.message_id))?;
        let message = row_to_message(&row)?;

        if message.lock_token != Some(req.lock_token) {
            let anomaly = Anomaly {
                anomaly_type: "lock_stolen".to_string(),
                severity: duramq_core::AnomalySeverity::Critical,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({
                    "expected_lock_token": message.lock_token,
                    "received_lock_token": req.lock_token,
                }),
            };
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Nack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.anomaly = Some(anomaly.clone());
            Self::insert_activity(&mut tx, &entry).await?;
            tx.commit().await?;
            return Ok(NackOutcome::LockMismatch { log_id: entry.log_id, anomaly });
        }

        let queue = self
            .get_queue(&message.queue)
            .await?
            .ok_or_else(|| StorageError::QueueNotFound(message.queue.clone()))?;
        let max_attempts = message.effective_max_attempts(&queue);

        if message.attempt_count < max_attempts {
            sqlx::query(
                "UPDATE messages SET status = 'queued', consumer_id = NULL, lock_token = NULL,
                    locked_at = NULL, locked_until = NULL, error_reason = $2 WHERE id = $1",
            )
            .bind(req.message_id)
            .bind(&req.reason)
            .execute(&mut *tx)
            .await?;

            let attempts_remaining = max_attempts - message.attempt_count;
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Nack, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.consumer_id = Some(req.consumer_id.clone());
            entry.attempt_count = Some(message.attempt_count);
            entry.max_attempts = Some(max_attempts);
            entry.attempts_remaining = Some(attempts_remaining);
            entry.error_reason = req.reason.clone();
            Self::insert_activity(&mut tx, &entry).await?;
            tx.commit().await?;

            let _ = self
                .notify(&QueueEvent {
                    queue: message.queue.clone(),
                    action: ActivityAction::Nack,
                    message_id: Some(req.message_id),
                    timestamp: entry.timestamp,
                })
                .await;
            Ok(NackOutcome::Requeued { log_id: entry.log_id, attempts_remaining })
        } else {
            sqlx::query(
                "UPDATE messages SET status = 'dead', consumer_id = NULL, lock_token = NULL,
                    locked_at = NULL, locked_until = NULL, error_reason = $2 WHERE id = $1",
            )
            .bind(req.message_id)
            .bind(&req.reason)
            .execute(&mut *tx)
            .await?;

            let anomaly = Anomaly {
                anomaly_type: "dlq_movement".to_string(),
                severity: duramq_core::AnomalySeverity::Warning,
                message_id: Some(req.message_id),
                consumer_id: Some(req.consumer_id.clone()),
                details: serde_json::json!({ "attempt_count": message.attempt_count, "max_attempts": max_attempts }),
            };
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Dlq, &message.queue);
            entry.message_id = Some(req.message_id);
            entry.consumer_id = Some(req.consumer_id.clone());
            entry.attempt_count = Some(message.attempt_count);
            entry.max_attempts = Some(max_attempts);
            entry.error_reason = req.reason.clone();
            entry.anomaly = Some(anomaly.clone());
            Self::insert_activity(&mut tx, &entry).await?;
            tx.commit().await?;

            let _ = self
                .notify(&QueueEvent {
                    queue: message.queue.clone(),
                    action: ActivityAction::Dlq,
                    message_id: Some(req.message_id),
                    timestamp: entry.timestamp,
                })
                .await;
            Ok(NackOutcome::DeadLettered { log_id: entry.log_id, anomaly })
        }
    }

    async fn touch(&self, req: TouchRequest, ack_timeout: Duration) -> Result<TouchOutcome, StorageError> {
        let now = Utc::now();
        let locked_until = now + ack_timeout;
        let result = sqlx::query(
            "UPDATE messages SET locked_until = $3 WHERE id = $1 AND lock_token = $2 AND status = 'processing'",
        )
        .bind(req.message_id)
        .bind(req.lock_token)
        .bind(locked_until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(TouchOutcome::LockMismatch);
        }

        let row = sqlx::query("SELECT queue FROM messages WHERE id = $1").bind(req.message_id).fetch_one(&self.pool).await?;
        let queue: String = row.try_get("queue")?;
        let mut tx = self.pool.begin().await?;
        let mut entry = Self::activity_base("system", ActivityAction::Touch, &queue);
        entry.message_id = Some(req.message_id);
        entry.lock_token = Some(req.lock_token);
        Self::insert_activity(&mut tx, &entry).await?;
        tx.commit().await?;

        Ok(TouchOutcome::Extended { locked_until })
    }

    async fn reap_expired(&self, now: DateTime<Utc>, triggered_by: &str) -> Result<Vec<ReapOutcome>, StorageError> {
        let expired = sqlx::query(
            "SELECT id FROM messages WHERE status = 'processing' AND locked_until < $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut outcomes = Vec::with_capacity(expired.len());
        for row in expired {
            let id: Uuid = row.try_get("id")?;
            let outcome = self.reap_one(id, now, triggered_by).await?;
            if let Some(o) = outcome {
                outcomes.push(o);
            }
        }
        Ok(outcomes)
    }

    async fn move_messages(&self, req: MoveRequest) -> Result<MoveOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let batch_id = Uuid::new_v4();
        let dest_status_str = status_str(req.dest_status);

        let rows = match &req.target {
            MoveTarget::Ids(ids) => {
                sqlx::query(
                    "UPDATE messages SET status = $2, queue = COALESCE($3, queue) WHERE id = ANY($1) RETURNING id, queue",
                )
                .bind(ids)
                .bind(dest_status_str)
                .bind(&req.dest_queue)
                .fetch_all(&mut *tx)
                .await?
            }
            MoveTarget::StatusFilter { queue, status } => {
                sqlx::query(
                    "UPDATE messages SET status = $3, queue = COALESCE($4, queue)
                     WHERE queue = $1 AND status = $2 RETURNING id, queue",
                )
                .bind(queue)
                .bind(status_str(*status))
                .bind(dest_status_str)
                .bind(&req.dest_queue)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let affected_count = rows.len() as u64;
        if affected_count > 0 {
            let source_queue: String = rows[0].try_get("queue")?;
            let mut entry = Self::activity_base(&req.triggered_by, ActivityAction::Move, &source_queue);
            entry.batch_id = Some(batch_id);
            entry.batch_size = Some(affected_count as u32);
            entry.source_queue = Some(source_queue);
            entry.dest_queue = req.dest_queue.clone();
            Self::insert_activity(&mut tx, &entry).await?;
        }

        tx.commit().await?;
        Ok(MoveOutcome { batch_id, affected_count })
    }

    async fn delete_messages(&self, ids: Vec<MessageId>, triggered_by: &str) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("DELETE FROM messages WHERE id = ANY($1) RETURNING queue").bind(&ids).fetch_all(&mut *tx).await?;
        for row in &rows {
            let queue: String = row.try_get("queue")?;
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Delete, &queue);
            Self::insert_activity(&mut tx, &entry).await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn clear_queue(&self, queue: &str, status: Option<MessageStatus>, triggered_by: &str) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let result = match status {
            Some(s) => {
                sqlx::query("DELETE FROM messages WHERE queue = $1 AND status = $2")
                    .bind(queue)
                    .bind(status_str(s))
                    .execute(&mut *tx)
                    .await?
            }
            None => sqlx::query("DELETE FROM messages WHERE queue = $1").bind(queue).execute(&mut *tx).await?,
        };
        let affected = result.rows_affected();

        if affected > 0 {
            let anomaly = Anomaly {
                anomaly_type: "queue_cleared".to_string(),
                severity: duramq_core::AnomalySeverity::Warning,
                message_id: None,
                consumer_id: None,
                details: serde_json::json!({ "affected_count": affected }),
            };
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Clear, queue);
            entry.batch_size = Some(affected as u32);
            entry.anomaly = Some(anomaly);
            Self::insert_activity(&mut tx, &entry).await?;
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn list_messages(&self, filter: MessageFilter, page: Pagination) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE ($1::text IS NULL OR queue = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR message_type = $3)
             ORDER BY created_at DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(&filter.queue)
        .bind(filter.status.map(status_str))
        .bind(&filter.message_type)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| row_to_message(r).map_err(StorageError::from)).collect()
    }

    async fn export_messages(&self, queue: &str) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE queue = $1 AND status = 'queued' ORDER BY created_at ASC")
            .bind(queue)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| row_to_message(r).map_err(StorageError::from)).collect()
    }

    async fn import_messages(&self, queue: &str, messages: Vec<Message>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(messages.len());
        for m in &messages {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO messages (id, queue, message_type, priority, payload, payload_size, status,
                    custom_max_attempts, custom_ack_timeout_seconds)
                 VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8)",
            )
            .bind(id)
            .bind(queue)
            .bind(&m.message_type)
            .bind(m.priority as i16)
            .bind(&m.payload)
            .bind(m.payload_size as i64)
            .bind(m.custom_max_attempts.map(|v| v as i32))
            .bind(m.custom_ack_timeout_seconds.map(|v| v as i32))
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        if !ids.is_empty() {
            let mut entry = Self::activity_base(triggered_by, ActivityAction::Enqueue, queue);
            entry.batch_id = Some(Uuid::new_v4());
            entry.batch_size = Some(ids.len() as u32);
            Self::insert_activity(&mut tx, &entry).await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn list_activity(&self, filter: ActivityFilter, page: Pagination) -> Result<Vec<ActivityLogEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM activity_log
             WHERE ($1::text IS NULL OR queue = $1)
               AND ($2::text IS NULL OR action = $2)
               AND ($3::uuid IS NULL OR message_id = $3)
             ORDER BY timestamp DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(&filter.queue)
        .bind(filter.action.map(action_str))
        .bind(filter.message_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_activity).collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    async fn attach_anomaly(&self, log_id: Uuid, anomaly: Anomaly) -> Result<(), StorageError> {
        sqlx::query("UPDATE activity_log SET anomaly = $2 WHERE log_id = $1")
            .bind(log_id)
            .bind(serde_json::to_value(&anomaly).unwrap_or_default())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn notify(&self, payload: &QueueEvent) -> Result<(), StorageError> {
        let json = serde_json::to_string(payload).map_err(|e| StorageError::Listener(e.to_string()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel_name)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }
}

impl PgStorageGateway {
    async fn reap_one(&self, id: Uuid, now: DateTime<Utc>, triggered_by: &str) -> Result<Option<ReapOutcome>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1 AND status = 'processing' FOR UPDATE SKIP LOCKED")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let message = row_to_message(&row)?;
        let queue = self
            .get_queue(&message.queue)
            .await?
            .ok_or_else(|| StorageError::QueueNotFound(message.queue.clone()))?;
        let max_attempts = message.effective_max_attempts(&queue);
        let expected_timeout_ms = message.effective_ack_timeout(&queue).num_milliseconds();
        let overdue_ms = message
            .locked_until
            .map(|lu| (now - lu).num_milliseconds())
            .unwrap_or(0);

        let prev_consumer_id = message.consumer_id.clone();
        let requeued = message.attempt_count < max_attempts;
        let new_status = if requeued { "queued" } else { "dead" };

        sqlx::query(
            "UPDATE messages SET status = $2, consumer_id = NULL, lock_token = NULL,
                locked_at = NULL, locked_until = NULL, prev_consumer_id = $3, prev_lock_token = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(new_status)
        .bind(&prev_consumer_id)
        .bind(message.lock_token)
        .execute(&mut *tx)
        .await?;

        let zombie_anomaly = if overdue_ms as f64 > expected_timeout_ms as f64 * 3.0 {
            Some(Anomaly {
                anomaly_type: "zombie_message".to_string(),
                severity: duramq_core::AnomalySeverity::Critical,
                message_id: Some(id),
                consumer_id: prev_consumer_id.clone(),
                details: serde_json::json!({ "overdue_ms": overdue_ms, "expected_timeout_ms": expected_timeout_ms }),
            })
        } else {
            None
        };

        let action = if requeued { ActivityAction::Timeout } else { ActivityAction::Dlq };
        let mut entry = Self::activity_base(triggered_by, action, &message.queue);
        entry.message_id = Some(id);
        entry.prev_consumer_id = prev_consumer_id.clone();
        entry.prev_lock_token = message.lock_token;
        entry.attempt_count = Some(message.attempt_count);
        entry.max_attempts = Some(max_attempts);
        entry.anomaly = zombie_anomaly.clone();
        Self::insert_activity(&mut tx, &entry).await?;
        tx.commit().await?;

        let _ = self
            .notify(&QueueEvent { queue: message.queue.clone(), action, message_id: Some(id), timestamp: entry.timestamp })
            .await;

        Ok(Some(ReapOutcome { message_id: id, prev_consumer_id, requeued, zombie_anomaly }))
    }
}

fn row_to_activity(row: &sqlx::postgres::PgRow) -> Result<ActivityLogEntry, sqlx::Error> {
    let action: String = row.try_get("action")?;
    let prev_action: Option<String> = row.try_get("prev_action")?;
    let anomaly: Option<serde_json::Value> = row.try_get("anomaly")?;
    Ok(ActivityLogEntry {
        log_id: row.try_get("log_id")?,
        message_id: row.try_get("message_id")?,
        action: parse_action(&action),
        timestamp: row.try_get("timestamp")?,
        queue: row.try_get("queue")?,
        source_queue: row.try_get("source_queue")?,
        dest_queue: row.try_get("dest_queue")?,
        priority: row.try_get::<Option<i16>, _>("priority")?.map(|v| v as u8),
        message_type: row.try_get("message_type")?,
        consumer_id: row.try_get("consumer_id")?,
        prev_consumer_id: row.try_get("prev_consumer_id")?,
        lock_token: row.try_get("lock_token")?,
        prev_lock_token: row.try_get("prev_lock_token")?,
        attempt_count: row.try_get::<Option<i32>, _>("attempt_count")?.map(|v| v as u32),
        max_attempts: row.try_get::<Option<i32>, _>("max_attempts")?.map(|v| v as u32),
        attempts_remaining: row.try_get::<Option<i32>, _>("attempts_remaining")?.map(|v| v as u32),
        message_created_at: row.try_get("message_created_at")?,
        message_age_ms: row.try_get("message_age_ms")?,
        time_in_queue_ms: row.try_get("time_in_queue_ms")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        total_processing_time_ms: row.try_get("total_processing_time_ms")?,
        payload_size_bytes: row.try_get::<Option<i64>, _>("payload_size_bytes")?.map(|v| v as u64),
        queue_depth: row.try_get("queue_depth")?,
        processing_depth: row.try_get("processing_depth")?,
        dlq_depth: row.try_get("dlq_depth")?,
        error_reason: row.try_get("error_reason")?,
        error_code: row.try_get("error_code")?,
        triggered_by: row.try_get("triggered_by")?,
        user_id: row.try_get("user_id")?,
        reason: row.try_get("reason")?,
        batch_id: row.try_get("batch_id")?,
        batch_size: row.try_get::<Option<i32>, _>("batch_size")?.map(|v| v as u32),
        prev_action: prev_action.as_deref().map(parse_action),
        prev_timestamp: row.try_get("prev_timestamp")?,
        payload_snapshot: row.try_get("payload_snapshot")?,
        anomaly: anomaly.and_then(|v| serde_json::from_value(v).ok()),
    })
}
