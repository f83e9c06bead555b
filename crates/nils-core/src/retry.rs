// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use nils_model::ProviderError;

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_retries: 3,
            retryable_statuses: vec![429, 500, 502, 503, 529],
        }
    }
}

impl RetrySettings {
    fn is_retryable(&self, error: &ProviderError) -> Option<u16> {
        error
            .status()
            .filter(|s| self.retryable_statuses.contains(s))
    }

    /// Exponential backoff with half-jitter:
    /// `floor(base · 2^(attempt-1) · (0.5 + rand))`, capped at max.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(32));
        let jitter: f64 = 0.5 + rand::thread_rng().gen::<f64>();
        let delay = ((exp as f64) * jitter) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Run `op` with retries on transient provider failures.
///
/// Only errors carrying a retryable HTTP status are retried, up to
/// `max_retries` extra attempts. A `Retry-After` from a 429 overrides the
/// computed backoff. Every retry calls `on_retry(attempt, delay_ms, status,
/// message)` before sleeping; the sleep aborts immediately when `cancel`
/// fires.
pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32, u64, u16, String),
    op: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let Some(status) = settings.is_retryable(&error) else {
                    return Err(error);
                };
                if attempt > settings.max_retries {
                    return Err(error);
                }

                let delay = match (status, error.retry_after()) {
                    (429, Some(after)) => after.min(Duration::from_millis(settings.max_delay_ms)),
                    _ => settings.backoff(attempt),
                };
                warn!(
                    attempt,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error; retrying"
                );
                on_retry(attempt, delay.as_millis() as u64, status, error.to_string());

                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn settings() -> RetrySettings {
        RetrySettings {
            base_delay_ms: 1,
            max_delay_ms: 10,
            max_retries: 2,
            retryable_statuses: vec![429, 500],
        }
    }

    #[tokio::test]
    async fn retry_after_429_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let events: Arc<Mutex<Vec<(u32, u16)>>> = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let events2 = events.clone();

        let result = with_retry(
            &settings(),
            &CancellationToken::new(),
            move |attempt, _delay, status, _msg| {
                events2.lock().unwrap().push((attempt, status));
            },
            move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::Http {
                            status: 429,
                            retry_after: Some(Duration::from_millis(0)),
                            message: "rate limited".into(),
                        })
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly two attempts");
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1, "one status event");
        assert_eq!(events[0], (1, 429));
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let err = with_retry(
            &settings(),
            &CancellationToken::new(),
            |_, _, _, _| {},
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProviderError::http(400, "bad request"))
                }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let err = with_retry(
            &settings(),
            &CancellationToken::new(),
            |_, _, _, _| {},
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProviderError::http(500, "down"))
                }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), Some(500));
        // initial attempt + max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn errors_without_status_are_not_retried() {
        let err = with_retry(
            &settings(),
            &CancellationToken::new(),
            |_, _, _, _| {},
            || async { Err::<(), _>(ProviderError::Aborted("eof".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Aborted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let slow = RetrySettings {
            base_delay_ms: 60_000,
            max_delay_ms: 120_000,
            max_retries: 3,
            retryable_statuses: vec![500],
        };
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel2.cancel();
        });
        let err = with_retry(&slow, &cancel, |_, _, _, _| {}, || async {
            Err::<(), _>(ProviderError::http(500, "down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let s = RetrySettings {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_retries: 10,
            retryable_statuses: vec![500],
        };
        for attempt in 1..=10 {
            let d = s.backoff(attempt).as_millis() as u64;
            assert!(d <= 1000, "attempt {attempt} delay {d} over cap");
            if attempt == 1 {
                // base · (0.5 + [0,1)) ∈ [50, 150)
                assert!((50..150).contains(&d), "unexpected first delay {d}");
            }
        }
    }
}
