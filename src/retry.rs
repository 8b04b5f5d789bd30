//! Bounded exponential backoff for transient provider failures.
//!
//! Backoff starts at 1s, doubles per attempt, and carries ±20% jitter
//! to avoid thundering-herd retries. Only errors classified transient
//! are retried; everything else surfaces immediately. Sleeps run on the
//! tokio timer, so dropping the future (deadline, shutdown) cancels the
//! loop between attempts.

use crate::errors::{AppError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Maximum attempts per call (1 initial + 4 retries).
pub const MAX_ATTEMPTS: u32 = 5;

/// Initial backoff delay.
const BASE_DELAY_MS: u64 = 1_000;

/// Compute the backoff delay before retry `attempt` (0-based), with
/// ±20% jitter applied.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = BASE_DELAY_MS * 2u64.pow(attempt.min(16));
    let jitter_range = base_ms / 5;
    let jittered = if jitter_range == 0 {
        base_ms
    } else {
        let offset = rand::thread_rng().gen_range(0..=2 * jitter_range) as i64 - jitter_range as i64;
        (base_ms as i64 + offset).max(1) as u64
    };
    Duration::from_millis(jittered)
}

/// Run `op` with bounded retries on transient failures.
///
/// `label` names the operation in logs and metrics. The last error is
/// returned once attempts are exhausted.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<AppError> = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay = backoff_delay(attempt - 1);
            warn!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure"
            );
            crate::metrics::LLM_RETRIES_TOTAL
                .with_label_values(&[label])
                .inc();
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err
        .unwrap_or_else(|| AppError::Transient(format!("{label}: retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_with_jitter_bounds() {
        for attempt in 0..4 {
            let base = BASE_DELAY_MS * 2u64.pow(attempt);
            let d = backoff_delay(attempt).as_millis() as u64;
            assert!(
                d >= base - base / 5 && d <= base + base / 5,
                "attempt {attempt}: {d}ms outside ±20% of {base}ms"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Permanent("schema mismatch".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::Transient("always down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
