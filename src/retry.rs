use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry an async operation with exponential backoff
pub async fn retry_async<F, Fut, T, E>(
    operation_name: &str,
    max_retries: u32,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_config(operation_name, max_retries, 100, operation).await
}

/// Retry with custom backoff settings
pub async fn retry_with_config<F, Fut, T, E>(
    operation_name: &str,
    max_retries: u32,
    initial_delay_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = Duration::from_millis(initial_delay_ms);

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_retries {
                    return Err(anyhow::anyhow!(
                        "{} failed after {} attempts: {}",
                        operation_name,
                        attempt,
                        e
                    ));
                }
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    operation_name, attempt, max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(5));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_async("equity", 5, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("unreachable")
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32> = retry_with_config("equity", 3, 10, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>("down")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
