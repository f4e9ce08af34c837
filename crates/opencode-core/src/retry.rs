//! Jittered exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::llm::ProviderError;

static RETRYABLE_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?refused")
        .expect("retry regex must compile")
});

/// Error text that indicates a transient failure even on a non-retryable status.
pub fn is_retryable_message(text: &str) -> bool {
    RETRYABLE_MESSAGE.is_match(text)
}

pub fn is_retryable_http_error(status: u16, text: &str) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504) || is_retryable_message(text)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
            .min(self.max);
        if self.jitter <= 0.0 {
            return exp;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        exp.mul_f64(factor).min(self.max)
    }

    /// Delay for a failed attempt, preferring the server's retry-after.
    pub fn delay_for(&self, retry: u32, err: &ProviderError) -> Duration {
        err.retry_after()
            .map(|d| d.min(self.max))
            .unwrap_or_else(|| self.delay(retry))
    }
}

/// Sleep unless canceled first. Returns false on cancellation.
pub async fn sleep_cancelable(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or is canceled.
pub async fn retry<T, F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Canceled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < backoff.max_attempts => {
                let delay = backoff.delay_for(attempt, &err);
                warn!(
                    target: "opencode::agent",
                    attempt = attempt + 1,
                    max_attempts = backoff.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying provider request: {}",
                    err
                );
                if !sleep_cancelable(cancel, delay).await {
                    return Err(ProviderError::Canceled);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retryable_http_errors() {
        assert!(is_retryable_http_error(429, ""));
        assert!(is_retryable_http_error(503, ""));
        assert!(is_retryable_http_error(400, "Rate limit exceeded"));
        assert!(is_retryable_http_error(400, "upstream connect error"));
        assert!(!is_retryable_http_error(400, "invalid schema"));
    }

    #[test]
    fn test_delay_is_capped_and_jittered() {
        let backoff = Backoff::default();
        for retry in 0..10 {
            let d = backoff.delay(retry);
            assert!(d <= backoff.max);
            let nominal = backoff.base.saturating_mul(1 << retry.min(16)).min(backoff.max);
            assert!(d >= nominal.mul_f64(0.8).min(backoff.max) - Duration::from_millis(1));
        }
    }

    #[test]
    fn test_retry_after_wins() {
        let backoff = Backoff::default();
        let err = ProviderError::RateLimited {
            message: "x".into(),
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(backoff.delay_for(0, &err), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(Backoff::default(), &CancellationToken::new(), move |_| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Transient("503".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry(Backoff::default(), &CancellationToken::new(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Transient("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry(Backoff::default(), &CancellationToken::new(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Auth("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = retry(Backoff::default(), &cancel, |_| async {
            Err(ProviderError::Transient("x".into()))
        })
        .await;
        assert_eq!(result, Err(ProviderError::Canceled));
    }
}
