//! Persistence boundary
//!
//! The reconciler, selector and synchronizer only see the [`Store`] trait.
//! [`SqliteStore`] is the production implementation; its in-memory variant
//! backs the scenario tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   JobSynchronizer / PlacementReconciler / control    │
//! └──────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              Store (+ Occupancy) trait               │
//! └──────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────┐
//! │          SqliteStore (file or in-memory)             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod sqlite;

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::models::{
    AuditRecord, ContentId, ContentItem, Destination, DestinationId, DestinationStatus, GroupId,
    NewContent, NewDestination, NewUnit, Placement, PlacementDraft, PlacementId, RemovalTarget,
    ScheduleUnit, UnitId,
};
use crate::scheduler::cron::CronSchedule;

pub use sqlite::SqliteStore;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A thread panicked while holding the connection
    #[error("Database connection lock poisoned")]
    Poisoned,

    /// A stored row could not be turned into a domain value
    #[error("Invalid {table} row {id}: {reason}")]
    InvalidRow {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored unit whose definition cannot be scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidUnit {
    pub unit_id: UnitId,
    pub reason: String,
}

/// Which content is live on a destination through other units
pub trait Occupancy {
    /// Content ids of active placements on `destination_id` owned by units other than `unit_id`
    fn occupied_by_others(
        &self,
        destination_id: DestinationId,
        unit_id: UnitId,
    ) -> StorageResult<HashSet<ContentId>>;
}

/// Read/write access to units, content, destinations, placements and the audit log
pub trait Store: Occupancy + Send + Sync {
    // ------------------------------------------------------------------
    // Administrative boundary
    // ------------------------------------------------------------------

    fn create_group(&self, name: &str) -> StorageResult<GroupId>;

    fn create_destination(&self, destination: &NewDestination) -> StorageResult<DestinationId>;

    fn add_group_member(&self, group_id: GroupId, destination_id: DestinationId) -> StorageResult<()>;

    fn set_destination_status(
        &self,
        destination_id: DestinationId,
        status: DestinationStatus,
        permissions_ok: bool,
    ) -> StorageResult<bool>;

    fn destination(&self, destination_id: DestinationId) -> StorageResult<Option<Destination>>;

    fn create_unit(&self, unit: &NewUnit) -> StorageResult<UnitId>;

    /// Returns false when the unit does not exist
    fn set_unit_enabled(&self, unit_id: UnitId, enabled: bool) -> StorageResult<bool>;

    /// Returns false when the unit does not exist
    fn set_unit_schedule(&self, unit_id: UnitId, schedule: &CronSchedule) -> StorageResult<bool>;

    /// Phase one of unit deletion: mark active placements deleted, drop the
    /// unit (cascading to its placements) and hand back what must be removed
    /// remotely. `None` when the unit does not exist.
    fn delete_unit(&self, unit_id: UnitId, at: DateTime<Utc>) -> StorageResult<Option<Vec<RemovalTarget>>>;

    fn create_content(&self, content: &NewContent) -> StorageResult<ContentId>;

    fn bind_content(&self, content_id: ContentId, unit_id: Option<UnitId>) -> StorageResult<bool>;

    fn set_content_enabled(&self, content_id: ContentId, enabled: bool) -> StorageResult<bool>;

    // ------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------

    fn unit(&self, unit_id: UnitId) -> StorageResult<Option<ScheduleUnit>>;

    /// Every enabled unit, with malformed definitions reported separately
    fn enabled_units(&self) -> StorageResult<Vec<Result<ScheduleUnit, InvalidUnit>>>;

    /// Enabled content bound to the unit, in id order
    fn content_pool(&self, unit_id: UnitId) -> StorageResult<Vec<ContentItem>>;

    /// Participating destinations of the unit's group, in id order
    fn unit_destinations(&self, unit: &ScheduleUnit) -> StorageResult<Vec<Destination>>;

    /// Active placements for the pair (at most one when state is sound)
    fn active_placements(
        &self,
        destination_id: DestinationId,
        unit_id: UnitId,
    ) -> StorageResult<Vec<Placement>>;

    /// The placement row for the pair, active or not
    fn placement(&self, destination_id: DestinationId, unit_id: UnitId) -> StorageResult<Option<Placement>>;

    fn unit_placements(&self, unit_id: UnitId) -> StorageResult<Vec<Placement>>;

    fn mark_deleted(&self, placement_id: PlacementId, at: DateTime<Utc>) -> StorageResult<()>;

    /// Insert or update the pair's row in place, making it active
    fn upsert_placement(&self, draft: &PlacementDraft) -> StorageResult<PlacementId>;

    fn set_rotation_offset(&self, unit_id: UnitId, offset: u32) -> StorageResult<()>;

    /// Phase one of a bulk clear, in one transaction
    fn clear_unit(&self, unit_id: UnitId, at: DateTime<Utc>) -> StorageResult<Vec<RemovalTarget>>;

    /// Mark every placement due for expiry deleted and return the remote posts
    fn take_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<RemovalTarget>>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    fn append_audit(&self, record: &AuditRecord) -> StorageResult<i64>;

    /// Newest first
    fn recent_audit(&self, limit: usize) -> StorageResult<Vec<AuditRecord>>;
}
