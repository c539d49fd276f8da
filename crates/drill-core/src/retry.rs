//! Bounded retry with exponential backoff.

use crate::error::DrillResult;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Total attempts, including the first one.
    pub count: u32,
    /// Delay after the first failure.
    pub interval: Duration,
    /// Factor applied to the delay after every failure.
    pub multiplier: u32,
    /// Upper bound for a single delay.
    pub max_interval: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            count: 3,
            interval: Duration::from_millis(20),
            multiplier: 3,
            max_interval: Duration::from_secs(3600),
        }
    }
}

/// Run `operation` until it succeeds or `options.count` attempts have failed.
///
/// Returns the last error when every attempt fails.
pub async fn with_retry<T, F, Fut>(options: RetryOptions, mut operation: F) -> DrillResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DrillResult<T>>,
{
    let attempts = options.count.max(1);
    let mut delay = options.interval;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, attempts, delay_ms = delay.as_millis() as u64, error = %e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay
                    .saturating_mul(options.multiplier)
                    .min(options.max_interval);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DrillError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn first_success_runs_once() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(RetryOptions::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DrillError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(RetryOptions::default(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DrillError::Closed)
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error_and_backs_off() {
        let calls = &AtomicU32::new(0);
        let started = Instant::now();
        let result: DrillResult<()> = with_retry(RetryOptions::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DrillError::Timeout)
        })
        .await;

        assert!(matches!(result, Err(DrillError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20ms + 60ms between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let options = RetryOptions {
            count: 4,
            interval: Duration::from_millis(100),
            multiplier: 10,
            max_interval: Duration::from_millis(250),
        };
        let started = Instant::now();
        let _ = with_retry(options, || async { Err::<(), _>(DrillError::Closed) }).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
    }

    #[tokio::test]
    async fn zero_count_still_attempts_once() {
        let calls = &AtomicU32::new(0);
        let options = RetryOptions {
            count: 0,
            ..Default::default()
        };
        let _ = with_retry(options, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DrillError::Closed)
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
