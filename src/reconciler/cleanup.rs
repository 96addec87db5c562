//! Background removal of remote posts
//!
//! Bulk clear, unit deletion and expiry all work in two phases. Phase one
//! marks the placements deleted in the store and captures the remote posts
//! as [`RemovalTarget`]s. Phase two, run here on a detached task, unpins and
//! deletes each post with a pause between targets. Phase two outcomes only
//! reach the audit log.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::gateway::RetryingGateway;
use crate::models::{AuditOp, AuditRecord, RemovalTarget};
use crate::storage::Store;

/// Counts from one removal batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub removed: usize,
    pub failed: usize,
}

impl RemovalReport {
    pub fn total(&self) -> usize {
        self.removed + self.failed
    }
}

/// Handle to a detached removal batch
#[derive(Debug)]
pub struct RemovalBatch {
    targets: usize,
    handle: JoinHandle<RemovalReport>,
}

impl RemovalBatch {
    /// Number of removals enqueued
    pub fn len(&self) -> usize {
        self.targets
    }

    pub fn is_empty(&self) -> bool {
        self.targets == 0
    }

    /// Wait for the batch to finish
    pub async fn wait(self) -> RemovalReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Removal task did not complete");
                RemovalReport {
                    removed: 0,
                    failed: self.targets,
                }
            }
        }
    }
}

/// Unpins and deletes captured posts, paced to respect rate limits
#[derive(Clone)]
pub struct RemovalWorker {
    store: Arc<dyn Store>,
    gateway: Arc<RetryingGateway>,
    clock: Arc<dyn Clock>,
    pause: Duration,
}

impl RemovalWorker {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<RetryingGateway>,
        clock: Arc<dyn Clock>,
        pause: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            pause,
        }
    }

    /// Run phase two on a detached task
    pub fn spawn(&self, targets: Vec<RemovalTarget>) -> RemovalBatch {
        let worker = self.clone();
        let count = targets.len();
        if count > 0 {
            info!(targets = count, "Enqueued background removals");
        }
        let handle = tokio::spawn(async move { worker.remove_all(targets).await });

        RemovalBatch {
            targets: count,
            handle,
        }
    }

    /// Remove every target in order
    pub async fn remove_all(&self, targets: Vec<RemovalTarget>) -> RemovalReport {
        let limiter: Option<DefaultDirectRateLimiter> =
            Quota::with_period(self.pause).map(RateLimiter::direct);

        let mut report = RemovalReport::default();
        for target in &targets {
            if let Some(limiter) = &limiter {
                limiter.until_ready().await;
            }

            if self.remove_one(target).await {
                report.removed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.total() > 0 {
            info!(removed = report.removed, failed = report.failed, "Background removals finished");
        }
        report
    }

    async fn remove_one(&self, target: &RemovalTarget) -> bool {
        let destination = &target.destination;

        if let Err(e) = self.gateway.unpin(destination, target.message).await {
            warn!(
                destination_id = destination.id,
                message = target.message.0,
                error = %e,
                "Unpin before delete failed"
            );
            self.audit(AuditRecord::failed(AuditOp::Unpin, &e, self.clock.now_utc()), target);
        }

        match self.gateway.delete(destination, target.message).await {
            Ok(()) => {
                debug!(destination_id = destination.id, message = target.message.0, "Removed post");
                self.audit(AuditRecord::success(AuditOp::Delete, self.clock.now_utc()), target);
                true
            }
            Err(e) => {
                error!(
                    destination_id = destination.id,
                    message = target.message.0,
                    error = %e,
                    "Failed to remove post"
                );
                self.audit(AuditRecord::failed(AuditOp::Delete, &e, self.clock.now_utc()), target);
                false
            }
        }
    }

    fn audit(&self, record: AuditRecord, target: &RemovalTarget) {
        let record = record
            .for_pair(target.unit_id, target.destination.id)
            .with_content(target.content_id)
            .with_message(Some(target.message));
        if let Err(e) = self.store.append_audit(&record) {
            error!(error = %e, "Failed to write audit record");
        }
    }
}

// ============================================================================
// Expiry sweeper
// ============================================================================

/// Removes `after_duration` placements once they are due
pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    worker: RemovalWorker,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn Store>, worker: RemovalWorker, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            worker,
            clock,
            interval,
        }
    }

    /// Mark due placements deleted and enqueue their removal
    pub fn sweep_once(&self) -> Result<RemovalBatch> {
        let expired = self.store.take_expired(self.clock.now_utc())?;
        if !expired.is_empty() {
            info!(expired = expired.len(), "Placements reached their deletion time");
        }
        Ok(self.worker.spawn(expired))
    }

    /// Sweep every interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Expiry sweeper stopping");
                        break;
                    }
                }
            }
        }
    }
}
