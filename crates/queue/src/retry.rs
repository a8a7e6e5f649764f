//! Exponential backoff around storage calls (spec §7: "Retryable storage —
//! transient database errors; retried with exponential backoff inside the
//! engine; if the retry budget is exhausted, surfaced as `StorageUnavailable`").

use std::future::Future;
use std::time::Duration;

use duramq_core::{error::is_transient, BrokerError, BrokerResult};
use duramq_storage::StorageError;

/// Attempts per operation, including the first try.
const MAX_STORAGE_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 25;

/// Run `f` until it succeeds, fails non-transiently, or exhausts the retry
/// budget. Only `StorageError::Database` errors classified transient by
/// [`duramq_core::error::is_transient`] are retried; everything else
/// surfaces immediately via the ordinary `StorageError -> BrokerError`
/// conversion.
pub async fn with_retry<F, Fut, T>(mut f: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(StorageError::Database(source)) if is_transient(&source) => {
                if attempt >= MAX_STORAGE_ATTEMPTS {
                    return Err(BrokerError::StorageUnavailable { attempts: attempt, source });
                }
                let backoff = BASE_BACKOFF_MS * (1u64 << (attempt - 1).min(4));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_on_ok() {
        let calls = AtomicU32::new(0);
        let result: BrokerResult<u32> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7u32) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: BrokerResult<()> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::QueueNotFound("orders".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
