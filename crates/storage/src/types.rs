//! Request/outcome types passed across the `StorageGateway` boundary.
//! These sit one layer below the queue engine's public API — they carry
//! enough context for the gateway to build the activity row atomically
//! with the state change (spec §4.1/§4.3).

use chrono::{DateTime, Duration, Utc};
use duramq_core::{ActivityAction, Anomaly, Message, MessageId, MessageStatus, PartitionInterval, Queue, QueueType};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewQueue {
    pub name: String,
    pub queue_type: QueueType,
    pub ack_timeout_seconds: u32,
    pub max_attempts: u32,
    pub partition_interval: Option<PartitionInterval>,
    pub retention_interval: Option<Duration>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueuePatch {
    pub ack_timeout_seconds: Option<u32>,
    pub max_attempts: Option<u32>,
    pub retention_interval: Option<Option<Duration>>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Minted by the caller (engine or enqueue buffer), not the gateway, so
    /// a buffered enqueue can hand the id back to its caller before the
    /// batch is actually flushed to storage.
    pub id: MessageId,
    pub queue: String,
    pub message_type: Option<String>,
    pub priority: u8,
    pub payload: Vec<u8>,
    pub custom_max_attempts: Option<u32>,
    pub custom_ack_timeout_seconds: Option<u32>,
}

/// A message handed to a consumer together with the anomaly context the
/// engine needs to finish building the dequeue activity row.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub message: Message,
    pub time_in_queue_ms: i64,
    /// Id of the activity row the gateway already wrote for this dequeue.
    /// The activity logger may call `attach_anomaly` against it once
    /// engine-level detectors (which need consumer/burst state the
    /// gateway doesn't track) have run.
    pub log_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct AckRequest {
    pub message_id: MessageId,
    pub lock_token: Uuid,
    pub consumer_id: String,
}

#[derive(Debug, Clone)]
pub enum AckOutcome {
    Acknowledged { log_id: Uuid, processing_time_ms: i64 },
    LockMismatch { log_id: Uuid, anomaly: Anomaly },
}

#[derive(Debug, Clone)]
pub struct NackRequest {
    pub message_id: MessageId,
    pub lock_token: Uuid,
    pub consumer_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum NackOutcome {
    Requeued { log_id: Uuid, attempts_remaining: u32 },
    DeadLettered { log_id: Uuid, anomaly: Anomaly },
    LockMismatch { log_id: Uuid, anomaly: Anomaly },
}

#[derive(Debug, Clone)]
pub struct TouchRequest {
    pub message_id: MessageId,
    pub lock_token: Uuid,
}

#[derive(Debug, Clone)]
pub enum TouchOutcome {
    Extended { locked_until: DateTime<Utc> },
    LockMismatch,
}

/// Result of one reaper sweep over a single expired-lock row.
#[derive(Debug, Clone)]
pub struct ReapOutcome {
    pub message_id: MessageId,
    pub prev_consumer_id: Option<String>,
    pub requeued: bool,
    pub zombie_anomaly: Option<Anomaly>,
}

#[derive(Debug, Clone)]
pub enum MoveTarget {
    Ids(Vec<MessageId>),
    StatusFilter { queue: String, status: MessageStatus },
}

#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub target: MoveTarget,
    pub dest_status: MessageStatus,
    pub dest_queue: Option<String>,
    pub triggered_by: String,
}

#[derive(Debug, Clone)]
pub struct MoveOutcome {
    pub batch_id: Uuid,
    pub affected_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub queue: Option<String>,
    pub status: Option<MessageStatus>,
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub queue: Option<String>,
    pub action: Option<ActivityAction>,
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 100, offset: 0 }
    }
}
