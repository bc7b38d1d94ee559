//! Retry Controller (spec §4.5).
//!
//! Wraps chunk execution with bounded exponential-backoff retry and
//! classifies errors transient vs. permanent. Grounded directly on
//! `http_utils.rs`'s `RetryConfig`/`calculate_backoff`/`is_retryable_status`
//! trio, generalized from HTTP status codes to the chunk error taxonomy of
//! §7, and on `coinbase_historical_ohlcv_job.rs::retry_failed_chunks`'s
//! backoff loop.

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::config::RetryConfig;
use crate::error::{OrchestratorError, PermanentSystemError, TransientIoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Cancelled,
}

/// Classify an orchestrator error per the table in spec §4.5.
pub fn classify(err: &OrchestratorError) -> ErrorClass {
    match err {
        OrchestratorError::Transient(_) => ErrorClass::Transient,
        OrchestratorError::PermanentSystem(_) => ErrorClass::Permanent,
        OrchestratorError::Cancelled => ErrorClass::Cancelled,
        OrchestratorError::Postgres(e) => classify_postgres_error(e),
        OrchestratorError::Pool(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

fn classify_postgres_error(err: &tokio_postgres::Error) -> ErrorClass {
    if let Some(db_err) = err.as_db_error() {
        use tokio_postgres::error::SqlState;
        let code = db_err.code();
        if *code == SqlState::T_R_SERIALIZATION_FAILURE
            || *code == SqlState::T_R_DEADLOCK_DETECTED
            || *code == SqlState::LOCK_NOT_AVAILABLE
            || *code == SqlState::CONNECTION_EXCEPTION
            || *code == SqlState::CONNECTION_DOES_NOT_EXIST
            || *code == SqlState::CONNECTION_FAILURE
        {
            return ErrorClass::Transient;
        }
        if *code == SqlState::UNDEFINED_TABLE
            || *code == SqlState::INSUFFICIENT_PRIVILEGE
            || *code == SqlState::SYNTAX_ERROR
        {
            return ErrorClass::Permanent;
        }
    }
    if err.is_closed() {
        return ErrorClass::Transient;
    }
    ErrorClass::Permanent
}

/// Exponential backoff with an optional full-jitter component, directly
/// generalizing `http_utils::calculate_backoff` (which has no jitter) by
/// adding the jitter and max-delay clamp spec §4.5/§6.4 both require.
pub fn backoff_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let exp = cfg.multiplier.powi(attempt.saturating_sub(1) as i32);
    let raw_ms = (cfg.initial_delay_ms as f64 * exp).min(cfg.max_delay_ms as f64);

    let delay_ms = if cfg.full_jitter {
        let mut rng = rand::thread_rng();
        rng.gen_range(0.0..=raw_ms)
    } else {
        raw_ms
    };

    Duration::from_millis(delay_ms as u64)
}

/// Run `attempt_fn` up to `max_retries + 1` times total (spec §8 property
/// 6), sleeping with exponential backoff between transient failures,
/// stopping immediately on a permanent or cancelled classification.
pub async fn with_retry<F, Fut, T>(
    cfg: &RetryConfig,
    cancelled: impl Fn() -> bool,
    mut attempt_fn: F,
) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, OrchestratorError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        match attempt_fn().await {
            Ok(v) => return Ok(v),
            Err(err) => match classify(&err) {
                ErrorClass::Cancelled => return Err(OrchestratorError::Cancelled),
                ErrorClass::Permanent => return Err(err),
                ErrorClass::Transient => {
                    if attempt > cfg.max_retries {
                        return Err(err);
                    }
                    if cancelled() {
                        return Err(OrchestratorError::Cancelled);
                    }
                    sleep(backoff_delay(attempt, cfg)).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            full_jitter: false,
        };
        assert_eq!(backoff_delay(1, &cfg).as_millis(), 1000);
        assert_eq!(backoff_delay(2, &cfg).as_millis(), 2000);
        assert_eq!(backoff_delay(3, &cfg).as_millis(), 4000);
        assert_eq!(backoff_delay(4, &cfg).as_millis(), 8000);
    }

    #[test]
    fn backoff_clamps_to_max_delay() {
        let cfg = RetryConfig {
            max_retries: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            multiplier: 2.0,
            full_jitter: false,
        };
        assert_eq!(backoff_delay(10, &cfg).as_millis(), 5000);
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let cfg = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            full_jitter: true,
        };
        for _ in 0..50 {
            let d = backoff_delay(3, &cfg).as_millis();
            assert!(d <= 4000);
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds_s4_chunk1() {
        // S4: chunk 1 deadlocks twice then succeeds on the third attempt.
        let attempts = Arc::new(AtomicU32::new(0));
        let cfg = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            full_jitter: false,
        };
        let a = attempts.clone();
        let result: Result<&str, OrchestratorError> = with_retry(&cfg, || false, move || {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(OrchestratorError::Transient(TransientIoError::Deadlock(
                        "deadlock".into(),
                    )))
                } else {
                    Ok("committed")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "committed");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry_s4_chunk2() {
        // S4: chunk 2 hits a missing-table error: exactly one attempt.
        let attempts = Arc::new(AtomicU32::new(0));
        let cfg = RetryConfig::default();
        let a = attempts.clone();
        let result: Result<(), OrchestratorError> = with_retry(&cfg, || false, move || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::PermanentSystem(PermanentSystemError::MissingTable(
                    "target".into(),
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_boundedness_property_6() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cfg = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            full_jitter: false,
        };
        let a = attempts.clone();
        let result: Result<(), OrchestratorError> = with_retry(&cfg, || false, move || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::Transient(TransientIoError::Timeout("t".into())))
            }
        })
        .await;
        assert!(result.is_err());
        // max_retries + 1 total attempts.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_stops_immediately_without_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cfg = RetryConfig::default();
        let a = attempts.clone();
        let result: Result<(), OrchestratorError> =
            with_retry(&cfg, || true, move || {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
