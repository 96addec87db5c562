//! Retry policy for gateway calls
//!
//! Rate limits wait for the platform-provided interval plus a small buffer.
//! Transient failures back off exponentially from `base_delay_ms`. Anything
//! else is permanent and returned immediately. At most `max_retries + 1`
//! attempts are made and the last error is returned when they run out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{GatewayError, GatewayRegistry, GatewayResult};
use crate::models::{ContentItem, Destination, MessageRef};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Added on top of the platform's retry-after hint
    pub rate_limit_buffer_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            rate_limit_buffer_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// Retry immediately, for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
            rate_limit_buffer_ms: 0,
        }
    }

    /// Backoff after the given zero-based failed attempt
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay before retrying after `error`
    pub fn delay_for(&self, error: &GatewayError, attempt: u32) -> Duration {
        match error {
            GatewayError::RateLimited { retry_after } => {
                *retry_after + Duration::from_millis(self.rate_limit_buffer_ms)
            }
            _ => self.backoff_delay(attempt),
        }
    }
}

/// Execute a gateway operation under the retry policy
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, op_name: &str, mut operation: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(op = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                debug!(op = op_name, error = %e, "Non-retryable error encountered");
                return Err(e);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    op = op_name,
                    attempts = attempt + 1,
                    error = %e,
                    "Retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(&e, attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Gateway facade that resolves the current handle and retries each call
pub struct RetryingGateway {
    registry: Arc<GatewayRegistry>,
    config: RetryConfig,
}

impl RetryingGateway {
    pub fn new(registry: Arc<GatewayRegistry>, config: RetryConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub async fn publish(&self, content: &ContentItem, destination: &Destination) -> GatewayResult<MessageRef> {
        let registry = &self.registry;
        with_retry(&self.config, "publish", move || async move {
            registry.current().await.publish(content, destination).await
        })
        .await
    }

    pub async fn pin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let registry = &self.registry;
        with_retry(&self.config, "pin", move || async move {
            registry.current().await.pin(destination, message).await
        })
        .await
    }

    /// Unpin; a message that is already gone counts as unpinned
    pub async fn unpin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let registry = &self.registry;
        let result = with_retry(&self.config, "unpin", move || async move {
            registry.current().await.unpin(destination, message).await
        })
        .await;
        tolerate_missing(result, "unpin", destination, message)
    }

    /// Delete; a message that is already gone counts as deleted
    pub async fn delete(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        let registry = &self.registry;
        let result = with_retry(&self.config, "delete", move || async move {
            registry.current().await.delete(destination, message).await
        })
        .await;
        tolerate_missing(result, "delete", destination, message)
    }
}

fn tolerate_missing(
    result: GatewayResult<()>,
    op: &str,
    destination: &Destination,
    message: MessageRef,
) -> GatewayResult<()> {
    match result {
        Err(GatewayError::NotFound(reason)) => {
            debug!(
                op,
                destination = destination.id,
                message = message.0,
                reason = %reason,
                "Message already gone"
            );
            Ok(())
        }
        other => other,
    }
}
