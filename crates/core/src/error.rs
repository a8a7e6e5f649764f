use thiserror::Error;

/// Top-level error taxonomy for the broker (spec §7).
///
/// Propagation policy: the engine recovers from transient storage errors,
/// reaper errors, and detector errors (a detector erroring is logged and
/// skipped, never fails the surrounding transaction). Everything else
/// surfaces to the caller.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Bad name, unknown queue, invalid priority, payload above the size cap.
    /// Nothing is written when this is returned.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lock token on ack/nack/touch does not match the row's current
    /// lock_token. Never mutates message state.
    #[error("lock mismatch: message {message_id} is not held by the presented lock token")]
    LockMismatch { message_id: uuid::Uuid },

    /// Retry budget exhausted on a transient storage error.
    #[error("storage unavailable after {attempts} attempts: {source}")]
    StorageUnavailable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// Constraint violation (e.g. duplicate id on import). Surfaced without
    /// partial effect.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Enqueue buffer full and flush failed.
    #[error("broker busy: {0}")]
    Busy(String),

    /// Engine is shutting down; enqueue rejects, in-flight ack/nack still
    /// complete.
    #[error("broker is closed")]
    Closed,

    /// Queue or message not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::StorageUnavailable { .. })
    }
}

/// Classify a raw `sqlx::Error` as transient (worth retrying with backoff)
/// or not, per the retry policy described in §10.2.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATE codes (08xxx) and serialization
            // failures (40001) are safe to retry.
            match db_err.code() {
                Some(code) => code.starts_with("08") || code == "40001" || code == "40P01",
                None => false,
            }
        }
        _ => false,
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            BrokerError::StorageUnavailable { attempts: 1, source: err }
        } else {
            match &err {
                sqlx::Error::RowNotFound => BrokerError::NotFound("row not found".to_string()),
                sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                    BrokerError::Integrity(format!("unique violation: {}", db_err.message()))
                }
                other => BrokerError::Integrity(other.to_string()),
            }
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
