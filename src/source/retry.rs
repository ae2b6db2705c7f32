use std::future::Future;
use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration};
use rand::Rng;

use crate::config::Config;
use crate::logging::{obj, v_int, v_str, warn, Domain};

/// Retry configuration
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
            max_delay_ms: 5000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.source_retry_count,
            base_delay_ms: cfg.source_retry_delay_ms,
            max_delay_ms: cfg.source_retry_max_delay_ms,
            ..Default::default()
        }
    }

    /// Exponential backoff clamped to `max_delay_ms`, then jittered.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Errors for which `retryable` returns false end the loop immediately.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    retryable: fn(&anyhow::Error) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !retryable(&e) {
                    return Err(e);
                }
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn(
                        Domain::Source,
                        "retry",
                        obj(&[
                            ("operation", v_str(operation_name)),
                            ("attempt", v_int(attempt as i64 + 1)),
                            ("max_attempts", v_int(config.max_retries as i64 + 1)),
                            ("delay_ms", v_int(delay.as_millis() as i64)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("retry_async exhausted without error")))
}

/// Categorize errors for retry decisions
pub fn is_retryable_http_error(status: u16) -> bool {
    matches!(status,
        408 |   // Request Timeout
        429 |   // Too Many Requests
        500 |   // Internal Server Error
        502 |   // Bad Gateway
        503 |   // Service Unavailable
        504     // Gateway Timeout
    )
}

/// Categorize network errors
pub fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Transport failures and retryable statuses are retried; anything else
/// (bad payloads, 4xx) fails the cycle at once.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(status) = err.downcast_ref::<StatusError>() {
        return is_retryable_http_error(status.0);
    }
    match err.downcast_ref::<reqwest::Error>() {
        Some(e) => is_retryable_network_error(e) || e.is_body() || e.is_decode(),
        None => true,
    }
}

/// Non-success HTTP status from the source.
#[derive(Debug, thiserror::Error)]
#[error("source returned HTTP {0}")]
pub struct StatusError(pub u16);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn any_error(_: &anyhow::Error) -> bool {
        true
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
    }

    #[test]
    fn test_from_config_uses_source_settings() {
        let cfg = Config {
            source_retry_count: 5,
            source_retry_delay_ms: 250,
            ..Config::default()
        };
        let rc = RetryConfig::from_config(&cfg);
        assert_eq!(rc.max_retries, 5);
        assert_eq!(rc.base_delay_ms, 250);
    }

    #[test]
    fn test_status_classification() {
        assert!(is_transient(&anyhow::Error::new(StatusError(503))));
        assert!(!is_transient(&anyhow::Error::new(StatusError(404))));
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            ..Default::default()
        };

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = retry_async(&config, "test", any_error, || {
            let c = counter_clone.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_last_error() {
        let config = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            ..Default::default()
        };
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = retry_async(&config, "test", any_error, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("fail {}", n))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "fail 2");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let config = RetryConfig { base_delay_ms: 1, ..Default::default() };
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = retry_async(&config, "test", is_transient, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::Error::new(StatusError(400)))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
