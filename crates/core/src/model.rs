//! Domain types shared by every broker crate: queues, messages, activity
//! log entries and anomalies. These are plain data — the state machine that
//! mutates them lives in `duramq-queue`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message identifier.
pub type MessageId = Uuid;

/// Validate a queue name against §3's charset (alphanumeric, `_`, `-`).
/// Surfaced as `Validation` so nothing is written on a bad name (§7).
pub fn validate_queue_name(name: &str) -> Result<(), crate::BrokerError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(crate::BrokerError::Validation(format!(
            "queue name {:?} must be non-empty and contain only alphanumerics, '_', or '-'",
            name
        )));
    }
    Ok(())
}

/// Storage layout hint. The engine's behavior does not depend on this value —
/// it only tells the storage gateway how to physically lay out the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Standard,
    Unlogged,
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionInterval {
    Hourly,
    Daily,
    Weekly,
}

/// A named queue and its independent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: u32,
    pub max_attempts: u32,
    pub partition_interval: Option<PartitionInterval>,
    pub retention_interval: Option<chrono::Duration>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Queue {
    /// Duration messages may sit unacknowledged before expiring back to
    /// queued/dead, as a `chrono::Duration`.
    pub fn ack_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ack_timeout_seconds as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Acknowledged,
    Dead,
    Archived,
}

/// A message in transit through a queue's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub queue: String,
    pub message_type: Option<String>,
    pub priority: u8,
    pub payload: Vec<u8>,
    pub payload_size: u64,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub custom_max_attempts: Option<u32>,
    pub custom_ack_timeout_seconds: Option<u32>,
    pub consumer_id: Option<String>,
    pub lock_token: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub prev_consumer_id: Option<String>,
    pub prev_lock_token: Option<Uuid>,
}

impl Message {
    /// Clamp a requested priority into the valid 0..=9 range.
    pub fn clamp_priority(priority: u8) -> u8 {
        priority.min(9)
    }

    /// Effective max attempts: the message's own override, or the queue default.
    pub fn effective_max_attempts(&self, queue: &Queue) -> u32 {
        self.custom_max_attempts.unwrap_or(queue.max_attempts)
    }

    /// Effective ack (visibility) timeout: the message's own override, or the
    /// queue default.
    pub fn effective_ack_timeout(&self, queue: &Queue) -> chrono::Duration {
        match self.custom_ack_timeout_seconds {
            Some(secs) => chrono::Duration::seconds(secs as i64),
            None => queue.ack_timeout(),
        }
    }
}

/// Actions recorded in the activity log, one per lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Enqueue,
    Dequeue,
    Ack,
    Nack,
    Move,
    Delete,
    Clear,
    Touch,
    Timeout,
    Requeue,
    Dlq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Critical,
    Warning,
    Info,
}

/// A classified observation attached to an activity log entry. Never alters
/// message state — purely descriptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_type: String,
    pub severity: AnomalySeverity,
    pub message_id: Option<MessageId>,
    pub consumer_id: Option<String>,
    pub details: serde_json::Value,
}

/// Append-only audit record. Denormalized so a message row can be deleted
/// without orphaning its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub log_id: Uuid,
    pub message_id: Option<MessageId>,
    pub action: ActivityAction,
    pub timestamp: DateTime<Utc>,
    pub queue: String,
    pub source_queue: Option<String>,
    pub dest_queue: Option<String>,
    pub priority: Option<u8>,
    pub message_type: Option<String>,
    pub consumer_id: Option<String>,
    pub prev_consumer_id: Option<String>,
    pub lock_token: Option<Uuid>,
    pub prev_lock_token: Option<Uuid>,
    pub attempt_count: Option<u32>,
    pub max_attempts: Option<u32>,
    pub attempts_remaining: Option<u32>,
    pub message_created_at: Option<DateTime<Utc>>,
    pub message_age_ms: Option<i64>,
    pub time_in_queue_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub total_processing_time_ms: Option<i64>,
    pub payload_size_bytes: Option<u64>,
    pub queue_depth: Option<i64>,
    pub processing_depth: Option<i64>,
    pub dlq_depth: Option<i64>,
    pub error_reason: Option<String>,
    pub error_code: Option<String>,
    pub triggered_by: String,
    pub user_id: Option<String>,
    pub reason: Option<String>,
    pub batch_id: Option<Uuid>,
    pub batch_size: Option<u32>,
    pub prev_action: Option<ActivityAction>,
    pub prev_timestamp: Option<DateTime<Utc>>,
    pub payload_snapshot: Option<serde_json::Value>,
    pub anomaly: Option<Anomaly>,
}

/// Derived per-consumer counters, refreshed on every successful dequeue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumerStats {
    pub last_dequeue_at: Option<DateTime<Utc>>,
    pub dequeue_count: u64,
}

/// Snapshot of per-status row counts for a queue, used both by admin
/// `getMetrics` and by detector thresholds (§4.5/§4.4 of the spec).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: i64,
    pub processing: i64,
    pub dead: i64,
    pub archived: i64,
}

/// Extra free-form fields attached to a detector context or activity entry
/// for forward-compatibility, per Design Note on dynamic-typed payloads.
pub type ExtraFields = HashMap<String, serde_json::Value>;

/// NOTIFY payload carried on the event channel (§6): `{queue, action,
/// message_id, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub queue: String,
    pub action: ActivityAction,
    pub message_id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
}
