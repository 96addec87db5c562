//! Publication scheduling
//!
//! # Overview
//!
//! Every enabled unit owns one recurring trigger built from its cron
//! expression. When it fires, the unit's cycle runs: the rotation selector
//! maps destinations to content and the reconciler applies that mapping.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   fires    ┌──────────────────────┐
//! │  JobSynchronizer │ ─────────▶ │  PlacementReconciler │
//! │  (one loop/unit) │            │      run_cycle       │
//! └────────┬─────────┘            └──────────┬───────────┘
//!          │ CronSchedule                    │ select
//!          ▼                                 ▼
//! ┌──────────────────┐            ┌──────────────────────┐
//! │       cron       │            │   RotationSelector   │
//! └──────────────────┘            └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cron`] - Typed five-field cron schedules
//! - [`rotation`] - Deterministic content rotation with cross-unit dedup
//! - [`trigger`] - Trigger set synchronization and firing
//! - [`error`] - Scheduler error types

pub mod cron;
pub mod error;
pub mod rotation;
pub mod trigger;

pub use cron::CronSchedule;
pub use error::{SchedulerError, SchedulerResult};
pub use rotation::{Assignment, Choice, RotationSelector, Selection, SkipReason};
pub use trigger::{plan_triggers, CycleRunner, JobSynchronizer, PlannedTrigger, SyncReport};
