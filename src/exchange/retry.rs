use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff applied at the transport boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Unit of the backoff: attempt `n` (0-based) waits `base * 2^(n+1)`
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Below this many remaining requests in the venue's window, slow down
    pub rate_limit_floor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            rate_limit_floor: 10,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retrying after failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_add(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Request quota as reported by the venue's response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeadroom {
    pub limit: u32,
    pub remaining: u32,
}

impl RateLimitHeadroom {
    /// Reads `X-Bapi-Limit` / `X-Bapi-Limit-Status`
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Option<Self> {
        let read = |name: &str| -> Option<u32> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        Some(Self {
            limit: read("X-Bapi-Limit")?,
            remaining: read("X-Bapi-Limit-Status")?,
        })
    }

    /// Sleep proportional to how far under `floor` the quota has fallen
    pub fn backoff(&self, floor: u32) -> Option<Duration> {
        if self.limit == 0 || self.remaining >= floor {
            return None;
        }
        let used = 1 + self.limit.saturating_sub(self.remaining);
        Some(Duration::from_secs_f64(
            5.0 * 60.0 * used as f64 / self.limit as f64,
        ))
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// Fatal and benign errors return immediately. Exhausting the attempts turns the
/// last transient error into `RetriesExhausted`, which is fatal.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!("Succeeded after {} attempts", attempt + 1);
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                if e.is_fatal() {
                    tracing::warn!("Fatal exchange error, not retrying: {}", e);
                }
                return Err(e);
            }
            Err(e) => {
                if attempt + 1 >= attempts {
                    tracing::error!("Giving up after {} attempts: {}", attempts, e);
                    return Err(ExchangeError::RetriesExhausted {
                        attempts,
                        last: e.to_string(),
                    });
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Transient exchange error: {}, retrying in {:?} (attempt {}/{})",
                    e,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
