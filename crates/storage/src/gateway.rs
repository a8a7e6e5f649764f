//! The storage gateway trait (spec §4.1). Implemented by [`crate::pg::PgStorageGateway`]
//! for production and [`crate::memory::InMemoryStorageGateway`] for tests, so the
//! queue engine can be driven by either without changing call sites — the same
//! split the teacher workspace uses for its queue-consumer abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duramq_core::{ActivityLogEntry, Message, MessageId, Queue, QueueDepth, QueueEvent};
use uuid::Uuid;

use crate::error::StorageError;
use crate::types::*;

#[async_trait]
pub trait StorageGateway: Send + Sync {
    // ── Queue administration (§4.7) ──────────────────────────────

    async fn create_queue(&self, queue: NewQueue) -> Result<Queue, StorageError>;
    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, StorageError>;
    async fn list_queues(&self) -> Result<Vec<Queue>, StorageError>;
    async fn update_queue(&self, name: &str, patch: QueuePatch) -> Result<Queue, StorageError>;
    async fn rename_queue(&self, old_name: &str, new_name: &str) -> Result<Queue, StorageError>;
    async fn delete_queue(&self, name: &str, force: bool) -> Result<(), StorageError>;
    async fn purge_queue(&self, name: &str) -> Result<u64, StorageError>;
    async fn queue_depth(&self, name: &str) -> Result<QueueDepth, StorageError>;

    // ── Message lifecycle (§4.1, §4.3) ───────────────────────────

    /// Atomically insert one message and its enqueue activity row.
    async fn enqueue_one(&self, msg: NewMessage, triggered_by: &str) -> Result<MessageId, StorageError>;

    /// Atomically insert a batch of messages with a single aggregate
    /// activity row (batch_size=N), per the enqueue buffer flush contract
    /// (§4.2).
    async fn enqueue_batch(&self, msgs: Vec<NewMessage>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError>;

    /// `lockAndClaim`: select up to `count` queued messages (optionally
    /// filtered by type), ordered by (priority desc, created_at asc),
    /// transition them to processing and write one dequeue activity row
    /// per message. Uses `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent
    /// consumers never block on each other.
    async fn dequeue_claim(
        &self,
        queue: &str,
        count: u32,
        consumer_id: &str,
        type_filter: Option<&str>,
        ack_timeout: chrono::Duration,
        triggered_by: &str,
    ) -> Result<Vec<ClaimedMessage>, StorageError>;

    async fn acknowledge(&self, req: AckRequest, triggered_by: &str) -> Result<AckOutcome, StorageError>;
    async fn nack(&self, req: NackRequest, triggered_by: &str) -> Result<NackOutcome, StorageError>;
    async fn touch(&self, req: TouchRequest, ack_timeout: chrono::Duration) -> Result<TouchOutcome, StorageError>;

    /// `findExpiredLocks` + the nack-equivalent transition, combined: each
    /// expired row is reclaimed in its own transaction so a concurrent
    /// reaper run (or a second instance) safely skips rows someone else
    /// already reclaimed.
    async fn reap_expired(&self, now: DateTime<Utc>, triggered_by: &str) -> Result<Vec<ReapOutcome>, StorageError>;

    async fn move_messages(&self, req: MoveRequest) -> Result<MoveOutcome, StorageError>;
    async fn delete_messages(&self, ids: Vec<MessageId>, triggered_by: &str) -> Result<u64, StorageError>;
    async fn clear_queue(
        &self,
        queue: &str,
        status: Option<duramq_core::MessageStatus>,
        triggered_by: &str,
    ) -> Result<u64, StorageError>;

    async fn list_messages(&self, filter: MessageFilter, page: Pagination) -> Result<Vec<Message>, StorageError>;
    async fn export_messages(&self, queue: &str) -> Result<Vec<Message>, StorageError>;
    async fn import_messages(&self, queue: &str, messages: Vec<Message>, triggered_by: &str) -> Result<Vec<MessageId>, StorageError>;

    // ── Activity log (§4.4) ──────────────────────────────────────

    async fn list_activity(&self, filter: ActivityFilter, page: Pagination) -> Result<Vec<ActivityLogEntry>, StorageError>;

    /// Patch the anomaly recorded against an already-committed activity
    /// row. Used by the activity logger (duramq-activity) once detectors
    /// requiring engine-level context (consumer burst counters, configured
    /// thresholds) have run against an outcome the gateway already wrote.
    async fn attach_anomaly(&self, log_id: Uuid, anomaly: duramq_core::Anomaly) -> Result<(), StorageError>;

    // ── Event channel (§4.1, §4.6) ───────────────────────────────

    /// Raw NOTIFY on the configured channel. The activity logger calls this
    /// post-commit; it never participates in the enclosing transaction.
    async fn notify(&self, payload: &QueueEvent) -> Result<(), StorageError>;

    /// Subscribe to the event channel. Implementations fan events in from
    /// a dedicated LISTEN connection (Postgres) or an in-process publish
    /// (the in-memory test double). The returned receiver observes only
    /// events published after subscription (§4.6: no replay).
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent>;
}

/// Stable placeholder lock token used by callers that want to generate
/// their own before calling into the gateway (none currently do; the
/// gateway mints tokens on claim). Kept here so the type shows up next to
/// the trait it belongs to.
pub fn new_lock_token() -> Uuid {
    Uuid::new_v4()
}
