//! Exponential backoff retry, generalized from a blanket "retry any error"
//! policy to one that only re-attempts [`EngineError::TransientIo`] (spec
//! section 4.1 / section 7). Auth, Validation, and any success are terminal.

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Retries `operation` while it returns `EngineError::TransientIo`, up to
/// `config.max_retries` additional attempts. Any other error, or exhaustion
/// of retries, propagates unchanged (spec: "errors that reach N retries
/// propagate unchanged; they MUST NOT be swallowed").
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                eprintln!(
                    "[retry] {operation_name} attempt {}/{} failed: {e}. Retrying in {delay:?}",
                    attempt + 1,
                    config.max_retries + 1,
                );
                sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn transient(symbol: &str) -> EngineError {
        EngineError::TransientIo {
            operation: "test",
            symbol: symbol.to_string(),
            message: "timeout".to_string(),
        }
    }

    #[test]
    fn delay_grows_exponentially_and_clamps() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
            jitter_factor: 0.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let config = RetryConfig::default();
        let result: Result<i32, EngineError> = retry_async(&config, "t", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let config = RetryConfig { base_delay_ms: 1, max_delay_ms: 2, ..Default::default() };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<i32, EngineError> = retry_async(&config, "t", || {
            let attempts = attempts_clone.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient("BTCUSDT"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_error_is_never_retried() {
        let config = RetryConfig { base_delay_ms: 1, max_delay_ms: 2, ..Default::default() };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<i32, EngineError> = retry_async(&config, "t", || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Auth {
                    operation: "placeLimit",
                    symbol: "BTCUSDT".to_string(),
                    message: "bad signature".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_unchanged() {
        let config = RetryConfig { max_retries: 2, base_delay_ms: 1, max_delay_ms: 2, jitter_factor: 0.0 };
        let result: Result<i32, EngineError> = retry_async(&config, "t", || async { Err(transient("ETHUSDT")) }).await;
        match result {
            Err(EngineError::TransientIo { symbol, .. }) => assert_eq!(symbol, "ETHUSDT"),
            other => panic!("expected TransientIo, got {other:?}"),
        }
    }
}
