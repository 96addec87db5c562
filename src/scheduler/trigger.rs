//! Recurring triggers, one per enabled unit
//!
//! [`JobSynchronizer::sync`] rebuilds the whole trigger set from the store:
//! every trigger loop it owns is aborted, then each enabled unit with a
//! valid, firing schedule gets a fresh loop keyed by its id. A loop sleeps
//! until the unit's next firing and spawns the cycle as its own task, so
//! aborting the loop during a resync never cancels a cycle in flight.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cron::CronSchedule;
use super::error::SchedulerError;
use crate::clock::Clock;
use crate::error::Result;
use crate::models::{ScheduleUnit, UnitId};
use crate::reconciler::CycleReport;
use crate::storage::{InvalidUnit, Store};

/// Firings later than this many seconds are dropped instead of run
const MISFIRE_GRACE_SECS: i64 = 60;

/// Something that can run a unit's publication cycle
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_unit(&self, unit_id: UnitId) -> Result<CycleReport>;
}

/// Outcome of a resync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Units with a live trigger, in id order
    pub scheduled: Vec<UnitId>,

    /// Enabled units left without a trigger, with the reason
    pub skipped: Vec<(UnitId, String)>,
}

/// A unit that would be scheduled, with its next firing
#[derive(Debug, Clone)]
pub struct PlannedTrigger {
    pub unit: ScheduleUnit,
    pub next_fire: DateTime<Tz>,
}

/// Split enabled units into schedulable ones and config errors
pub fn plan_triggers(
    units: Vec<std::result::Result<ScheduleUnit, InvalidUnit>>,
    now: &DateTime<Tz>,
) -> (Vec<PlannedTrigger>, Vec<(UnitId, String)>) {
    let mut planned = Vec::new();
    let mut skipped = Vec::new();

    for unit in units {
        match unit {
            Err(invalid) => {
                error!(unit_id = invalid.unit_id, reason = %invalid.reason, "Invalid unit definition, not scheduling");
                skipped.push((invalid.unit_id, invalid.reason));
            }
            Ok(unit) => match unit.publish_cron.next_after(now) {
                Some(next_fire) => planned.push(PlannedTrigger { unit, next_fire }),
                None => {
                    let err = SchedulerError::NoUpcomingFire {
                        unit_id: unit.id,
                        expression: unit.publish_cron.expression().to_string(),
                    };
                    error!(unit_id = unit.id, "{err}");
                    skipped.push((unit.id, err.to_string()));
                }
            },
        }
    }

    (planned, skipped)
}

struct RegisteredTrigger {
    schedule: CronSchedule,
    handle: JoinHandle<()>,
}

/// Owns the live trigger set
pub struct JobSynchronizer {
    store: Arc<dyn Store>,
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
    triggers: Mutex<HashMap<UnitId, RegisteredTrigger>>,
}

impl JobSynchronizer {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn CycleRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            runner,
            clock,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Initial sync when the engine comes up
    pub async fn start(&self) -> Result<SyncReport> {
        info!(timezone = %self.clock.timezone(), "Starting trigger engine");
        self.sync().await
    }

    /// Make the live triggers match the enabled units exactly
    pub async fn sync(&self) -> Result<SyncReport> {
        let units = self.store.enabled_units()?;
        let (planned, skipped) = plan_triggers(units, &self.clock.now());

        let mut triggers = self.triggers.lock().await;
        for (_, trigger) in triggers.drain() {
            trigger.handle.abort();
        }

        let mut scheduled = Vec::with_capacity(planned.len());
        for PlannedTrigger { unit, next_fire } in planned {
            debug!(unit_id = unit.id, cron = %unit.publish_cron, next_fire = %next_fire, "Registering trigger");

            let handle = tokio::spawn(trigger_loop(
                unit.id,
                unit.publish_cron.clone(),
                self.runner.clone(),
                self.clock.clone(),
            ));
            triggers.insert(
                unit.id,
                RegisteredTrigger {
                    schedule: unit.publish_cron,
                    handle,
                },
            );
            scheduled.push(unit.id);
        }
        scheduled.sort_unstable();

        info!(scheduled = scheduled.len(), skipped = skipped.len(), "Triggers synchronized");
        Ok(SyncReport { scheduled, skipped })
    }

    /// Units with a live trigger, in id order
    pub async fn registered_units(&self) -> Vec<UnitId> {
        let triggers = self.triggers.lock().await;
        let mut ids: Vec<UnitId> = triggers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Next firing of a registered unit
    pub async fn next_fire(&self, unit_id: UnitId) -> Option<DateTime<Tz>> {
        let triggers = self.triggers.lock().await;
        triggers
            .get(&unit_id)
            .and_then(|t| t.schedule.next_after(&self.clock.now()))
    }

    /// Stop every trigger loop; running cycles finish on their own
    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.lock().await;
        let count = triggers.len();
        for (_, trigger) in triggers.drain() {
            trigger.handle.abort();
        }
        info!(stopped = count, "Trigger engine stopped");
    }
}

async fn trigger_loop(
    unit_id: UnitId,
    schedule: CronSchedule,
    runner: Arc<dyn CycleRunner>,
    clock: Arc<dyn Clock>,
) {
    let mut cursor = clock.now();

    loop {
        let Some(next) = schedule.next_after(&cursor) else {
            warn!(unit_id, cron = %schedule, "Schedule has no further firings");
            return;
        };

        let wait = (next.with_timezone(&Utc) - clock.now_utc())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        cursor = next;

        let late = clock.now_utc() - next.with_timezone(&Utc);
        if late.num_seconds() > MISFIRE_GRACE_SECS {
            warn!(unit_id, scheduled = %next, late_secs = late.num_seconds(), "Missed firing, skipping");
            cursor = clock.now();
            continue;
        }

        debug!(unit_id, fire_at = %next, "Trigger fired");
        let runner = runner.clone();
        tokio::spawn(async move {
            match runner.run_unit(unit_id).await {
                Ok(report) => debug!(
                    unit_id,
                    published = report.published(),
                    failed = report.failed(),
                    "Cycle completed"
                ),
                Err(e) => error!(unit_id, category = e.category().as_str(), error = %e, "Cycle failed"),
            }
        });
    }
}
