//! Unified error handling for the slotcast crate
//!
//! Each subsystem owns a specific error type; [`Error`] wraps them so the
//! reconciler and the CLI can work with a single type while still asking the
//! underlying cause whether it is worth retrying.
//!
//! # Usage
//!
//! ```rust,ignore
//! use slotcast::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = ?err.category(), "will retry next cycle: {err}");
//!     } else {
//!         tracing::error!("fatal: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::models::{DestinationId, UnitId};

// Re-export domain-specific errors for convenience
pub use crate::gateway::GatewayError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StorageError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad configuration or admin input
    Config,
    /// Cron and trigger problems
    Scheduler,
    /// Nothing eligible to publish
    Selection,
    /// Messaging platform failures
    Delivery,
    /// Persistence failures
    Storage,
    /// Persisted state broke a structural guarantee
    Invariant,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Scheduler => "scheduler",
            Self::Selection => "selection",
            Self::Delivery => "delivery",
            Self::Storage => "storage",
            Self::Invariant => "invariant",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the slotcast crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or admin input errors
    #[error("Config error: {0}")]
    Config(String),

    /// Scheduler and timing errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// No eligible content for a unit (or for one of its destinations)
    #[error("{}", selection_message(.unit_id, .destination_id))]
    SelectionExhausted {
        unit_id: UnitId,
        destination_id: Option<DestinationId>,
    },

    /// Messaging gateway errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] GatewayError),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// More than one active placement for a destination/unit pair
    #[error(
        "State invariant violated: {active} active placements for destination {destination_id} unit {unit_id}"
    )]
    StateInvariantViolation {
        destination_id: DestinationId,
        unit_id: UnitId,
        active: usize,
    },

    /// Unit does not exist
    #[error("Unit {0} not found")]
    UnitNotFound(UnitId),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn selection_message(unit_id: &UnitId, destination_id: &Option<DestinationId>) -> String {
    match destination_id {
        Some(dest) => format!("No eligible content for unit {unit_id} on destination {dest}"),
        None => format!("No eligible content for unit {unit_id}"),
    }
}

impl Error {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is recoverable (worth retrying on a later cycle)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Delivery(e) => e.is_retryable(),
            Self::Storage(_) => true,
            Self::SelectionExhausted { .. } => true,
            Self::Io(_) => true,
            Self::Config(_) | Self::StateInvariantViolation { .. } | Self::UnitNotFound(_) => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::UnitNotFound(_) => ErrorCategory::Config,
            Self::Scheduler(SchedulerError::InvalidCron { .. })
            | Self::Scheduler(SchedulerError::InvalidTimezone { .. }) => ErrorCategory::Config,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::SelectionExhausted { .. } => ErrorCategory::Selection,
            Self::Delivery(_) => ErrorCategory::Delivery,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::StateInvariantViolation { .. } => ErrorCategory::Invariant,
            Self::Io(_) => ErrorCategory::Other,
        }
    }
}

/// Result type alias using the unified Error
pub type Result<T> = std::result::Result<T, Error>;
