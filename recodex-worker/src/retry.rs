//! Fixed-backoff retry loops for transport operations.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::WorkerError;

/// Retry `op` up to `attempts` times with a fixed delay. Permanent errors
/// and cancellation abort immediately; the last transient error is
/// returned once the attempts run out.
pub async fn retry_fixed<T, F, Fut>(
    label: &str,
    attempts: usize,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let mut last = WorkerError::Other(format!("{label}: no attempts made"));
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(WorkerError::Canceled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_permanent() => return Err(err),
            Err(err) => {
                warn!(label, attempt, error = %err, "retrying after error");
                last = err;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    Err(last)
}

/// Retry until success or cancellation; for operations that must
/// eventually happen, like event publishing and artifact upload.
pub async fn retry_forever<T, F, Fut>(
    label: &str,
    delay: Duration,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    retry_fixed(label, usize::MAX, delay, cancel, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let cancel = CancellationToken::new();
        let result = retry_fixed("test", 5, Duration::from_millis(10), &cancel, move || {
            async move {
                if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WorkerError::HttpStatus(500))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_abort() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;
        let cancel = CancellationToken::new();
        let result: Result<(), _> =
            retry_fixed("test", 5, Duration::from_millis(10), &cancel, move || {
                async move {
                    calls_ref.fetch_add(1, Ordering::SeqCst);
                    Err(WorkerError::JobNotFound)
                }
            })
            .await;
        assert!(matches!(result, Err(WorkerError::JobNotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> =
            retry_fixed("test", 3, Duration::from_millis(10), &cancel, || async {
                Err(WorkerError::HttpStatus(503))
            })
            .await;
        assert!(matches!(result, Err(WorkerError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry_fixed("test", 3, Duration::from_secs(5), &cancel, || async {
                Err(WorkerError::HttpStatus(503))
            })
            .await;
        assert!(matches!(result, Err(WorkerError::Canceled)));
    }
}
