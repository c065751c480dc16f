//! Retry Policy: exponential backoff with jitter for establishing a
//! provider stream, honoring a server-specified `Retry-After` when present.

use crate::error::ProviderError;
use std::time::Duration;
use tracing::warn;

/// Defaults: 3 attempts, 2s initial delay, 2x backoff, 30s max delay.
/// Use `RetryConfig::none()` to disable retries entirely.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (1 = no retries).
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff for a given attempt (1-indexed), ±20% jitter, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi((attempt - 1) as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((capped_ms * jitter) as u64)
    }
}

/// Parses a `Retry-After` header value: either an integer number of
/// seconds, or an HTTP-date. We only need the delta, so RFC 2822 parsing via
/// `chrono` is enough without pulling in an extra date-parsing dependency.
pub fn parse_retry_after(value: &str, max_delay: Duration) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(max_delay));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let now = chrono::Utc::now();
    let delta = when.with_timezone(&chrono::Utc) - now;
    let millis = delta.num_milliseconds().max(0) as u64;
    Some(Duration::from_millis(millis).min(max_delay))
}

fn log_retry(attempt: usize, max: usize, delay: Duration, error: &ProviderError) {
    warn!(
        attempt,
        max_attempts = max,
        delay_ms = delay.as_millis() as u64,
        %error,
        "provider stream establishment failed, retrying"
    );
}

/// Retries *establishing* a provider stream. `establish` is called again from scratch
/// on each attempt; once it returns `Ok`, the caller owns the stream and no
/// further retry happens even if the stream later errors mid-flight.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut establish: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1;
    loop {
        match establish().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_attempts && err.is_retryable() => {
                let delay = match &err {
                    ProviderError::RateLimited {
                        retry_after: Some(raw),
                    } => parse_retry_after(raw, config.max_delay)
                        .unwrap_or_else(|| config.delay_for_attempt(attempt)),
                    _ => config.delay_for_attempt(attempt),
                };
                log_retry(attempt, config.max_attempts, delay, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
