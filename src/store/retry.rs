use std::future::Future;
use std::time::Duration;

use crate::error::LedgerError;

/// Bounded-retry policy applied at the store-adapter boundary. Only
/// `StorageUnavailable` is retried; domain errors surface immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(LedgerError::StorageUnavailable(reason)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(LedgerError::StorageUnavailable(reason));
                }
                let delay = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(attempt, ?delay, %reason, "transient storage failure, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::StorageUnavailable("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(LedgerError::StorageUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LedgerError::InsufficientCredits {
                    required: 5,
                    available: 1,
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientCredits { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_when_storage_comes_back() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        };
        let calls = AtomicU32::new(0);
        let result = with_backoff(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LedgerError::StorageUnavailable("locked".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
