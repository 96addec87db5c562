//! slotcast - cron-driven publication scheduler
//!
//! Rotates promotional posts across messaging channels. Each schedule unit
//! fires on its own cron expression, picks content for every destination in
//! its group and replaces whatever it posted there last time.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Units, content, destinations, placements and audit records
//! - [`clock`] - Process-wide timezone and time source
//! - [`scheduler`] - Cron schedules, content rotation and trigger management
//! - [`reconciler`] - Applying selections to destinations, background removals
//! - [`gateway`] - Messaging platform boundary with a shared retry contract
//! - [`storage`] - Persistence (SQLite)
//! - [`control`] - Administrative operations and their side effects
//! - [`app`] - Service wiring
//!
//! # Example
//!
//! ```no_run
//! use slotcast::app::Services;
//! use slotcast::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     let services = Services::build(&config)?;
//!     services.synchronizer.start().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod gateway;
pub mod models;
pub mod reconciler;
pub mod scheduler;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, FixedClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::control::UnitControl;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::gateway::{Gateway, GatewayError, GatewayRegistry, RetryingGateway};
    pub use crate::models::{
        AuditRecord, ContentItem, DeletePolicy, Destination, Placement, ScheduleUnit, SelectionMode,
    };
    pub use crate::reconciler::{ApplyOutcome, CycleReport, PlacementReconciler};
    pub use crate::scheduler::{CronSchedule, JobSynchronizer, RotationSelector};
    pub use crate::storage::{SqliteStore, Store};
}

pub use models::{ContentItem, Destination, Placement, ScheduleUnit};
