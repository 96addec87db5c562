//! Administrative entry points
//!
//! Each operation commits its store change first and then brings the rest
//! of the system in line: the trigger set is resynced, and any remote posts
//! that must go are handed to the background removal worker.

use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::UnitId;
use crate::reconciler::cleanup::{RemovalBatch, RemovalWorker};
use crate::scheduler::cron::CronSchedule;
use crate::scheduler::trigger::{JobSynchronizer, SyncReport};
use crate::storage::Store;

/// Unit lifecycle operations with their side effects
pub struct UnitControl {
    store: Arc<dyn Store>,
    synchronizer: Arc<JobSynchronizer>,
    worker: RemovalWorker,
    clock: Arc<dyn Clock>,
}

impl UnitControl {
    pub fn new(
        store: Arc<dyn Store>,
        synchronizer: Arc<JobSynchronizer>,
        worker: RemovalWorker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            synchronizer,
            worker,
            clock,
        }
    }

    /// Enable or disable a unit, then resync triggers
    pub async fn set_enabled(&self, unit_id: UnitId, enabled: bool) -> Result<SyncReport> {
        if !self.store.set_unit_enabled(unit_id, enabled)? {
            return Err(Error::UnitNotFound(unit_id));
        }
        info!(unit_id, enabled, "Unit toggled");
        self.synchronizer.sync().await
    }

    /// Replace a unit's publish schedule, then resync triggers
    ///
    /// The expression is validated before anything is written.
    pub async fn reschedule(&self, unit_id: UnitId, expression: &str) -> Result<SyncReport> {
        let schedule = CronSchedule::parse(expression)?;
        if !self.store.set_unit_schedule(unit_id, &schedule)? {
            return Err(Error::UnitNotFound(unit_id));
        }
        info!(unit_id, cron = %schedule, "Unit rescheduled");
        self.synchronizer.sync().await
    }

    /// Clear every live post of a unit
    ///
    /// Returns once the placements are marked deleted; the remote removals
    /// continue in the background.
    pub fn clear(&self, unit_id: UnitId) -> Result<RemovalBatch> {
        if self.store.unit(unit_id)?.is_none() {
            return Err(Error::UnitNotFound(unit_id));
        }

        let targets = self.store.clear_unit(unit_id, self.clock.now_utc())?;
        info!(unit_id, targets = targets.len(), "Unit cleared");
        Ok(self.worker.spawn(targets))
    }

    /// Delete a unit together with its placements
    pub async fn delete(&self, unit_id: UnitId) -> Result<RemovalBatch> {
        let targets = match self.store.delete_unit(unit_id, self.clock.now_utc())? {
            Some(targets) => targets,
            None => return Err(Error::UnitNotFound(unit_id)),
        };
        info!(unit_id, targets = targets.len(), "Unit deleted");

        let batch = self.worker.spawn(targets);
        if let Err(e) = self.synchronizer.sync().await {
            warn!(unit_id, error = %e, "Resync after unit deletion failed");
        }
        Ok(batch)
    }
}
