//! Placement reconciler
//!
//! Applies a unit's [`Selection`] to its destinations. Replacing what a
//! destination shows is a two-step, best-effort sequence modelled by
//! [`Replacement`]:
//!
//! ```text
//! Pending ──supersede──▶ Superseding ──publish──▶ Published
//!                                        │
//!                                        └──────▶ Failed
//! ```
//!
//! Superseding removes the previous post (unpin, then delete) and marks its
//! placement deleted whatever the platform said. Publishing posts the new
//! content, pins it and upserts the placement row in place. Destinations are
//! processed independently so one slow or failing destination never aborts
//! the rest of the cycle.

pub mod cleanup;

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{Error, ErrorCategory, Result};
use crate::gateway::{GatewayError, RetryingGateway};
use crate::models::{
    AuditOp, AuditRecord, ContentId, ContentItem, Destination, DestinationId, MessageRef, Placement,
    PlacementDraft, ScheduleUnit, UnitId,
};
use crate::scheduler::rotation::{Choice, RotationSelector, SkipReason};
use crate::scheduler::trigger::CycleRunner;
use crate::storage::Store;

pub use cleanup::{ExpirySweeper, RemovalBatch, RemovalReport, RemovalWorker};

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Destinations processed at the same time within one cycle
    pub max_parallel_destinations: usize,

    /// Upper bound for one destination's supersede + publish
    pub destination_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_parallel_destinations: 4,
            destination_timeout: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of applying one assignment
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Skipped(SkipReason),
    Published {
        content_id: ContentId,
        message: MessageRef,
    },
    Failed {
        category: ErrorCategory,
        error: String,
    },
}

impl ApplyOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Why a whole cycle did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSkip {
    UnitMissing,
    UnitDisabled,
    NoDestinations,
    NoContent,
}

/// Summary of one unit cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub unit_id: UnitId,
    pub skipped: Option<CycleSkip>,
    pub outcomes: Vec<(DestinationId, ApplyOutcome)>,
    pub next_offset: Option<u32>,
}

impl CycleReport {
    fn skipped(unit_id: UnitId, reason: CycleSkip) -> Self {
        Self {
            unit_id,
            skipped: Some(reason),
            outcomes: Vec::new(),
            next_offset: None,
        }
    }

    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_published()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }

    pub fn outcome_for(&self, destination_id: DestinationId) -> Option<&ApplyOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == destination_id)
            .map(|(_, outcome)| outcome)
    }
}

// ============================================================================
// Replacement state machine
// ============================================================================

/// Where a replacement currently stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplacePhase {
    /// Nothing touched yet
    Pending,
    /// Previous post removed (best-effort) and its placement marked deleted
    Superseding,
    /// New content is live
    Published(MessageRef),
    /// Publishing failed; the pair has no active placement
    Failed(String),
}

/// Replace-in-place for one (destination, unit) pair
///
/// The publish audit record is written by [`PlacementReconciler::apply`];
/// the replacement itself only audits the delete and pin side effects.
pub struct Replacement<'r> {
    reconciler: &'r PlacementReconciler,
    unit: &'r ScheduleUnit,
    destination: &'r Destination,
    previous: Option<Placement>,
    phase: ReplacePhase,
}

impl<'r> Replacement<'r> {
    pub fn phase(&self) -> &ReplacePhase {
        &self.phase
    }

    /// The active placement found when the replacement began
    pub fn previous(&self) -> Option<&Placement> {
        self.previous.as_ref()
    }

    /// Remove the previous post and mark its placement deleted
    pub async fn supersede(&mut self) -> Result<()> {
        if self.phase != ReplacePhase::Pending {
            return Ok(());
        }

        let r = self.reconciler;
        if let Some(previous) = &self.previous {
            if let Some(message) = previous.message {
                if let Err(e) = r.gateway.unpin(self.destination, message).await {
                    warn!(
                        unit_id = self.unit.id,
                        destination_id = self.destination.id,
                        error = %e,
                        "Failed to unpin previous post"
                    );
                }

                let record = match r.gateway.delete(self.destination, message).await {
                    Ok(()) => AuditRecord::success(AuditOp::Delete, r.clock.now_utc()),
                    Err(e) => {
                        warn!(
                            unit_id = self.unit.id,
                            destination_id = self.destination.id,
                            message = message.0,
                            error = %e,
                            "Failed to delete previous post, publishing anyway"
                        );
                        AuditRecord::failed(AuditOp::Delete, &e, r.clock.now_utc())
                    }
                };
                r.audit(
                    record
                        .for_pair(self.unit.id, self.destination.id)
                        .with_content(previous.content_id)
                        .with_message(Some(message)),
                );
            }

            r.store.mark_deleted(previous.id, r.clock.now_utc())?;
        }

        self.phase = ReplacePhase::Superseding;
        Ok(())
    }

    /// Publish and record the new placement.
    ///
    /// The placement row is written with no await between the gateway
    /// answering and the upsert, so cancelling this future can never leave a
    /// live post the store does not know about.
    pub async fn publish(&mut self, content: &ContentItem) -> Result<MessageRef> {
        if self.phase == ReplacePhase::Pending {
            self.supersede().await?;
        }

        let r = self.reconciler;
        let message = match r.gateway.publish(content, self.destination).await {
            Ok(message) => message,
            Err(e) => {
                self.phase = ReplacePhase::Failed(e.to_string());
                return Err(e.into());
            }
        };

        let published_at = r.clock.now_utc();
        let draft = PlacementDraft {
            destination_id: self.destination.id,
            unit_id: self.unit.id,
            content_id: content.id,
            message,
            pinned: true,
            published_at,
            scheduled_delete_at: self.unit.delete_policy.scheduled_delete_at(published_at),
        };

        if let Err(e) = r.store.upsert_placement(&draft) {
            error!(
                unit_id = self.unit.id,
                destination_id = self.destination.id,
                message = message.0,
                error = %e,
                "Published but failed to record placement"
            );
            self.phase = ReplacePhase::Failed(e.to_string());
            return Err(e.into());
        }

        self.phase = ReplacePhase::Published(message);
        Ok(message)
    }

    /// Pin the freshly published post; failures are audited, never fatal
    pub async fn pin(&self, content: &ContentItem) {
        let ReplacePhase::Published(message) = self.phase else {
            return;
        };

        let r = self.reconciler;
        if let Err(e) = r.gateway.pin(self.destination, message).await {
            warn!(
                unit_id = self.unit.id,
                destination_id = self.destination.id,
                message = message.0,
                error = %e,
                "Failed to pin new post"
            );
            r.audit(
                AuditRecord::failed(AuditOp::Pin, &e, r.clock.now_utc())
                    .for_pair(self.unit.id, self.destination.id)
                    .with_content(Some(content.id))
                    .with_message(Some(message)),
            );
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Runs publication cycles and applies assignments
pub struct PlacementReconciler {
    store: Arc<dyn Store>,
    gateway: Arc<RetryingGateway>,
    selector: RotationSelector,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl PlacementReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<RetryingGateway>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            selector: RotationSelector::new(),
            clock,
            config,
        }
    }

    /// Start a replacement, refusing pairs whose state is already broken
    pub fn begin<'r>(
        &'r self,
        unit: &'r ScheduleUnit,
        destination: &'r Destination,
    ) -> Result<Replacement<'r>> {
        let mut active = self.store.active_placements(destination.id, unit.id)?;
        if active.len() > 1 {
            error!(
                unit_id = unit.id,
                destination_id = destination.id,
                active = active.len(),
                "More than one active placement for pair"
            );
            return Err(Error::StateInvariantViolation {
                destination_id: destination.id,
                unit_id: unit.id,
                active: active.len(),
            });
        }

        Ok(Replacement {
            reconciler: self,
            unit,
            destination,
            previous: active.pop(),
            phase: ReplacePhase::Pending,
        })
    }

    /// Supersede and publish under the destination timeout, then pin.
    ///
    /// Pinning runs after the placement is recorded and outside the timeout,
    /// so a slow pin cannot turn a delivered post into a failed one.
    async fn replace(
        &self,
        unit: &ScheduleUnit,
        destination: &Destination,
        content: &ContentItem,
    ) -> Result<MessageRef> {
        let mut replacement = self.begin(unit, destination)?;

        let delivered = tokio::time::timeout(self.config.destination_timeout, async {
            replacement.supersede().await?;
            replacement.publish(content).await
        })
        .await;

        let message = match delivered {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Delivery(GatewayError::Transient(format!(
                    "destination processing timed out after {}s",
                    self.config.destination_timeout.as_secs()
                ))))
            }
        };

        replacement.pin(content).await;
        Ok(message)
    }

    /// Apply one assignment, recording the publish outcome
    pub async fn apply(
        &self,
        unit: &ScheduleUnit,
        destination: &Destination,
        choice: Choice,
    ) -> ApplyOutcome {
        let content = match choice {
            Choice::Skip(reason) => return ApplyOutcome::Skipped(reason),
            Choice::Publish(content) => content,
        };

        let result = self.replace(unit, destination, &content).await;

        let now = self.clock.now_utc();
        match result {
            Ok(message) => {
                info!(
                    unit_id = unit.id,
                    destination_id = destination.id,
                    content_id = content.id,
                    message = message.0,
                    "Published"
                );
                self.audit(
                    AuditRecord::success(AuditOp::Publish, now)
                        .for_pair(unit.id, destination.id)
                        .with_content(Some(content.id))
                        .with_message(Some(message)),
                );
                ApplyOutcome::Published {
                    content_id: content.id,
                    message,
                }
            }
            Err(e) => {
                error!(
                    unit_id = unit.id,
                    destination_id = destination.id,
                    content_id = content.id,
                    category = e.category().as_str(),
                    error = %e,
                    "Publish failed"
                );
                self.audit(
                    AuditRecord::failed(AuditOp::Publish, &e, now)
                        .for_pair(unit.id, destination.id)
                        .with_content(Some(content.id)),
                );
                ApplyOutcome::Failed {
                    category: e.category(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run one full publication cycle for a unit
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, unit_id: UnitId) -> Result<CycleReport> {
        let unit = match self.store.unit(unit_id)? {
            Some(unit) => unit,
            None => {
                info!(unit_id, "Unit no longer exists, skipping cycle");
                return Ok(CycleReport::skipped(unit_id, CycleSkip::UnitMissing));
            }
        };

        if !unit.enabled {
            info!(unit_id, "Unit is disabled, skipping cycle");
            return Ok(CycleReport::skipped(unit_id, CycleSkip::UnitDisabled));
        }

        let destinations = self.store.unit_destinations(&unit)?;
        if destinations.is_empty() {
            warn!(unit_id, group_id = unit.group_id, "Unit has no participating destinations");
            return Ok(CycleReport::skipped(unit_id, CycleSkip::NoDestinations));
        }

        let pool = self.store.content_pool(unit.id)?;
        let date = self.clock.today();
        let selection = match self
            .selector
            .select(&unit, &pool, &destinations, self.store.as_ref(), date)
        {
            Ok(selection) => selection,
            Err(e @ Error::SelectionExhausted { .. }) => {
                warn!(unit_id, mode = %unit.mode, "{e}, skipping cycle");
                return Ok(CycleReport::skipped(unit_id, CycleSkip::NoContent));
            }
            Err(e) => return Err(e),
        };

        info!(
            unit = %unit.label(),
            destinations = selection.assignments.len(),
            "Running publication cycle"
        );

        let unit_ref = &unit;
        let outcomes: Vec<(DestinationId, ApplyOutcome)> = stream::iter(selection.assignments)
            .map(|assignment| async move {
                let outcome = self
                    .apply(unit_ref, &assignment.destination, assignment.choice)
                    .await;
                (assignment.destination.id, outcome)
            })
            .buffer_unordered(self.config.max_parallel_destinations.max(1))
            .collect()
            .await;

        if let Some(next) = selection.next_offset {
            self.store.set_rotation_offset(unit.id, next)?;
        }

        let mut report = CycleReport {
            unit_id,
            skipped: None,
            outcomes,
            next_offset: selection.next_offset,
        };
        report.outcomes.sort_by_key(|(id, _)| *id);

        info!(
            unit_id,
            published = report.published(),
            failed = report.failed(),
            "Cycle finished"
        );
        Ok(report)
    }

    fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.store.append_audit(&record) {
            error!(op = record.op.as_str(), error = %e, "Failed to write audit record");
        }
    }
}

#[async_trait::async_trait]
impl CycleRunner for PlacementReconciler {
    async fn run_unit(&self, unit_id: UnitId) -> Result<CycleReport> {
        self.run_cycle(unit_id).await
    }
}
