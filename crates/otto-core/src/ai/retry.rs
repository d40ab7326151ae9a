//! Rate-limit retry logic
//!
//! Backends under load answer 429; those calls are retried a bounded
//! number of times with a fixed backoff. Every other transport error
//! propagates immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::client::ClientError;

/// Retry policy for rate-limited requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-rate-limit error, or the
/// attempt budget is exhausted.
pub async fn with_rate_limit_retry<T, F, Fut>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut last_err = None;
    for attempt in 1..=config.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limit() => {
                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    "{} rate limited, backing off {:?}",
                    label,
                    config.backoff
                );
                last_err = Some(err);
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.backoff).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| ClientError::Transport("retry budget exhausted".to_string())))
}
