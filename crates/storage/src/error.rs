use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(uuid::Uuid),

    #[error("lock mismatch on message {0}")]
    LockMismatch(uuid::Uuid),

    #[error("queue {0} is not empty")]
    QueueNotEmpty(String),

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("listener error: {0}")]
    Listener(String),
}

impl From<StorageError> for duramq_core::BrokerError {
    fn from(err: StorageError) -> Self {
        use duramq_core::BrokerError;
        match err {
            StorageError::Database(e) if duramq_core::error::is_transient(&e) => {
                BrokerError::StorageUnavailable { attempts: 1, source: e }
            }
            StorageError::Database(e) => BrokerError::Integrity(e.to_string()),
            StorageError::QueueNotFound(name) => BrokerError::NotFound(format!("queue {}", name)),
            StorageError::MessageNotFound(id) => BrokerError::NotFound(format!("message {}", id)),
            StorageError::LockMismatch(id) => BrokerError::LockMismatch { message_id: id },
            StorageError::QueueNotEmpty(name) => {
                BrokerError::Validation(format!("queue {} is not empty", name))
            }
            StorageError::UniqueViolation(msg) => BrokerError::Integrity(msg),
            StorageError::Listener(msg) => BrokerError::Validation(msg),
        }
    }
}
