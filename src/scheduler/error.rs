//! Error types for the scheduler module

use std::fmt;

use crate::models::UnitId;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Cron expression could not be parsed
    InvalidCron { expression: String, reason: String },

    /// Expression is valid but never fires (e.g. Feb 31st)
    NoUpcomingFire { unit_id: UnitId, expression: String },

    /// Unknown IANA timezone name
    InvalidTimezone { tz: String },

    /// Trigger execution error
    TriggerExecutionFailed { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCron { expression, reason } => {
                write!(f, "Invalid cron expression '{}': {}", expression, reason)
            }
            Self::NoUpcomingFire {
                unit_id,
                expression,
            } => {
                write!(
                    f,
                    "Unit {} has no upcoming firing for '{}'",
                    unit_id, expression
                )
            }
            Self::InvalidTimezone { tz } => {
                write!(f, "Invalid timezone: {}", tz)
            }
            Self::TriggerExecutionFailed { reason } => {
                write!(f, "Trigger execution failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create an invalid cron error
    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCron {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid timezone error
    pub fn invalid_timezone(tz: impl Into<String>) -> Self {
        Self::InvalidTimezone { tz: tz.into() }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TriggerExecutionFailed { .. })
    }
}
