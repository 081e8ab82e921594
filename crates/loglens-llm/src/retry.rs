use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use loglens_core::config::RetryConfig;
use loglens_core::error::{LoglensError, Result};
use loglens_core::traits::Reasoner;

/// A reasoner that retries transient failures with exponential backoff.
pub struct RetryingReasoner {
    inner: Box<dyn Reasoner>,
    retry_config: RetryConfig,
}

impl RetryingReasoner {
    pub fn new(inner: Box<dyn Reasoner>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &LoglensError) -> bool {
    match e {
        LoglensError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl Reasoner for RetryingReasoner {
    fn reason(&self, prompt: &str, context: &str) -> BoxFuture<'_, Result<String>> {
        let prompt = prompt.to_string();
        let context = context.to_string();
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.reason(&prompt, &context).await {
                    Ok(text) => return Ok(text),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying reasoning request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
        error: fn() -> LoglensError,
    }

    impl Reasoner for Flaky {
        fn reason(&self, _prompt: &str, _context: &str) -> BoxFuture<'_, Result<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < self.failures {
                    Err((self.error)())
                } else {
                    Ok("done".to_string())
                }
            })
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    fn overloaded() -> LoglensError {
        LoglensError::LlmRequest("HTTP 503 Service Unavailable: overloaded".into())
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&overloaded()));
        assert!(is_retryable(&LoglensError::LlmRequest("HTTP 429 Too Many Requests".into())));
        assert!(is_retryable(&LoglensError::LlmRequest("operation timeout".into())));
        assert!(!is_retryable(&LoglensError::LlmRequest("HTTP 401 Unauthorized".into())));
        assert!(!is_retryable(&LoglensError::LlmParse("bad json".into())));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::default();
        let first = calculate_backoff(0, &config).as_millis();
        assert!((800..=1200).contains(&first));
        let capped = calculate_backoff(10, &config).as_millis();
        assert!(capped <= 36_000);
        assert!(capped >= 24_000);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let reasoner = RetryingReasoner::new(
            Box::new(Flaky {
                failures: 2,
                calls: calls.clone(),
                error: overloaded,
            }),
            fast(),
        );
        assert_eq!(reasoner.reason("p", "c").await.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let reasoner = RetryingReasoner::new(
            Box::new(Flaky {
                failures: 10,
                calls: calls.clone(),
                error: overloaded,
            }),
            fast(),
        );
        assert!(reasoner.reason("p", "c").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let reasoner = RetryingReasoner::new(
            Box::new(Flaky {
                failures: 10,
                calls: calls.clone(),
                error: || LoglensError::LlmRequest("HTTP 401 Unauthorized".into()),
            }),
            fast(),
        );
        assert!(reasoner.reason("p", "c").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
