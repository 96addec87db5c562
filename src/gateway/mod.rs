//! Messaging gateway
//!
//! The reconciler talks to the platform only through the [`Gateway`] trait.
//! [`GatewayRegistry`] holds the live handle and lets it be replaced while
//! cycles are running; [`retry::RetryingGateway`] layers the retry policy on
//! top of whatever handle is current at the time of each attempt.

pub mod retry;
pub mod telegram;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::models::{ContentItem, Destination, MessageRef};

pub use retry::{RetryConfig, RetryingGateway};
pub use telegram::{TelegramConfig, TelegramGateway};

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classified platform failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Platform asked us to back off
    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// Timeout, connection or network failure
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Message or chat is already gone
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bot lacks permission in the destination
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request was rejected as malformed
    #[error("Invalid content: {0}")]
    InvalidContent(String),

    /// Handle was shut down (usually by a registry swap)
    #[error("Gateway handle closed")]
    Closed,
}

impl GatewayError {
    /// Whether the retry wrapper should try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Closed
        )
    }
}

/// Operations the reconciler needs from a messaging platform
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Get the gateway name for logging
    fn name(&self) -> &str;

    /// Post content to a destination, returning the new message reference
    async fn publish(&self, content: &ContentItem, destination: &Destination) -> GatewayResult<MessageRef>;

    /// Pin a message silently
    async fn pin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()>;

    async fn unpin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()>;

    async fn delete(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()>;

    /// Release resources; later calls should fail with [`GatewayError::Closed`]
    async fn close(&self) {}
}

/// Holder of the current gateway handle
pub struct GatewayRegistry {
    current: RwLock<Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            current: RwLock::new(gateway),
        }
    }

    /// The handle to use for the next call
    pub async fn current(&self) -> Arc<dyn Gateway> {
        self.current.read().await.clone()
    }

    /// Replace the handle, closing the old one before the new one is visible
    pub async fn swap(&self, gateway: Arc<dyn Gateway>) {
        let mut current = self.current.write().await;
        tracing::info!(old = current.name(), new = gateway.name(), "Swapping gateway handle");
        current.close().await;
        *current = gateway;
    }
}
