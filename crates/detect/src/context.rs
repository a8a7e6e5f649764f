//! Read-only context handed to every detector (spec §4.5). Detectors never
//! call back into the engine or storage gateway — they see this struct and
//! nothing else, breaking the cycle described in the Design Notes.

use duramq_core::{DetectorConfig, MessageId};
use serde_json::Value;
use std::collections::HashMap;

/// The event kinds detectors can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Enqueue,
    Dequeue,
    Ack,
    Nack,
    TimeoutRequeue,
    BulkOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperationType {
    Enqueue,
    Delete,
    Move,
    Clear,
}

#[derive(Debug, Clone, Default)]
pub struct DetectorContext {
    pub event: Option<EventKind>,
    pub queue: String,
    pub message_id: Option<MessageId>,
    pub consumer_id: Option<String>,

    pub priority: Option<u8>,
    pub payload_size: Option<u64>,
    pub attempt_count: Option<u32>,
    pub max_attempts: Option<u32>,
    pub attempts_remaining: Option<u32>,

    pub time_in_queue_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub overdue_ms: Option<i64>,
    pub expected_timeout_ms: Option<i64>,

    pub expected_lock_token: Option<uuid::Uuid>,
    pub received_lock_token: Option<uuid::Uuid>,

    pub bulk_operation: Option<BulkOperationType>,
    pub affected_count: Option<u64>,

    /// Count of dequeues this consumer has made on this queue within the
    /// configured burst window — supplied by the caller (duramq-queue keeps
    /// this as a short-lived per-consumer counter; the registry itself is
    /// stateless).
    pub recent_dequeue_count: Option<u32>,

    pub thresholds: DetectorConfig,
    pub extra: HashMap<String, Value>,
}

impl DetectorContext {
    pub fn new(event: EventKind, queue: impl Into<String>, thresholds: DetectorConfig) -> Self {
        Self { event: Some(event), queue: queue.into(), thresholds, ..Default::default() }
    }
}
