use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ModelError;

/// Exponential retry policy for establishing a model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first call.
    #[serde(default)]
    pub max_retries: u32,
    /// Initial backoff before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Exponential multiplier per retry step.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_initial_backoff_ms() -> u64 {
    2_000
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(2, default_initial_backoff_ms(), default_backoff_factor())
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn exponential(max_retries: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        let initial = if initial_backoff_ms == 0 {
            default_initial_backoff_ms()
        } else {
            initial_backoff_ms
        };
        let factor = if backoff_factor <= 0.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            max_retries,
            initial_backoff_ms: initial,
            backoff_factor: factor,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms.max(1);
        self
    }

    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    pub fn backoff_duration(&self, retries_done: u32) -> Duration {
        if self.max_retries == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_factor.powi(retries_done as i32);
        let base = (self.initial_backoff_ms as f64 * exp).round() as u64;
        let clamped = base.min(self.max_backoff_ms.max(1));
        Duration::from_millis(clamped)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, the
/// policy is exhausted, or `token` fires. Backoff sleeps end early on cancellation.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut attempt: F,
) -> Result<T, ModelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let mut retries_done = 0;
    loop {
        if token.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let retryable = err.is_retryable();
        let can_retry = retryable && !token.is_cancelled() && policy.can_retry(retries_done);
        debug!(
            event = "model.call_failed",
            domain = "model",
            attempt = retries_done + 1,
            retryable = retryable,
            can_retry = can_retry,
            error = %err
        );
        if !can_retry {
            return Err(err);
        }
        let backoff = policy.backoff_duration(retries_done);
        info!(
            event = "model.retry_scheduled",
            domain = "model",
            next_attempt = retries_done + 2,
            backoff_ms = backoff.as_millis() as u64
        );
        tokio::select! {
            _ = token.cancelled() => return Err(ModelError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
        retries_done += 1;
    }
}
