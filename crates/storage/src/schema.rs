//! Reference schema for the `PgStorageGateway` (§6: "Relational schema
//! with at minimum: queues, messages, activity_log, and an optional
//! anomalies table"). Schema bootstrap and migrations are out of scope
//! for this crate (spec Non-goals) — this is documentation for whoever
//! owns the database, not something the gateway executes.
//!
//! ```sql
//! CREATE TABLE queues (
//!     name                  TEXT PRIMARY KEY,
//!     queue_type            TEXT NOT NULL DEFAULT 'standard',
//!     ack_timeout_seconds   INTEGER NOT NULL DEFAULT 30,
//!     max_attempts          INTEGER NOT NULL DEFAULT 5,
//!     partition_interval    TEXT,
//!     retention_interval_seconds BIGINT,
//!     description           TEXT,
//!     created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE TABLE messages (
//!     id                          UUID PRIMARY KEY,
//!     queue                       TEXT NOT NULL REFERENCES queues(name),
//!     message_type                TEXT,
//!     priority                    SMALLINT NOT NULL DEFAULT 0,
//!     payload                     BYTEA NOT NULL,
//!     payload_size                BIGINT NOT NULL,
//!     status                      TEXT NOT NULL DEFAULT 'queued',
//!     attempt_count               INTEGER NOT NULL DEFAULT 0,
//!     custom_max_attempts         INTEGER,
//!     custom_ack_timeout_seconds  INTEGER,
//!     consumer_id                 TEXT,
//!     lock_token                  UUID,
//!     locked_at                   TIMESTAMPTZ,
//!     locked_until                TIMESTAMPTZ,
//!     created_at                  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     acknowledged_at             TIMESTAMPTZ,
//!     error_reason                TEXT,
//!     prev_consumer_id            TEXT,
//!     prev_lock_token             UUID
//! );
//! CREATE INDEX messages_claim_idx ON messages (queue, status, priority DESC, created_at ASC);
//!
//! CREATE TABLE activity_log (
//!     log_id                   UUID PRIMARY KEY,
//!     message_id               UUID,
//!     action                   TEXT NOT NULL,
//!     timestamp                TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     queue                    TEXT NOT NULL,
//!     source_queue             TEXT,
//!     dest_queue               TEXT,
//!     priority                 SMALLINT,
//!     message_type             TEXT,
//!     consumer_id              TEXT,
//!     prev_consumer_id         TEXT,
//!     lock_token               UUID,
//!     prev_lock_token          UUID,
//!     attempt_count            INTEGER,
//!     max_attempts             INTEGER,
//!     attempts_remaining       INTEGER,
//!     message_created_at       TIMESTAMPTZ,
//!     message_age_ms           BIGINT,
//!     time_in_queue_ms         BIGINT,
//!     processing_time_ms       BIGINT,
//!     total_processing_time_ms BIGINT,
//!     payload_size_bytes       BIGINT,
//!     queue_depth              BIGINT,
//!     processing_depth         BIGINT,
//!     dlq_depth                BIGINT,
//!     error_reason             TEXT,
//!     error_code               TEXT,
//!     triggered_by             TEXT NOT NULL,
//!     user_id                  TEXT,
//!     reason                   TEXT,
//!     batch_id                 UUID,
//!     batch_size               INTEGER,
//!     prev_action              TEXT,
//!     prev_timestamp           TIMESTAMPTZ,
//!     payload_snapshot         JSONB,
//!     anomaly                  JSONB
//! );
//! CREATE INDEX activity_log_message_idx ON activity_log (message_id, timestamp);
//! CREATE INDEX activity_log_queue_idx ON activity_log (queue, timestamp DESC);
//! ```
