//! Trigger synchronization tests
//!
//! Time is paused, and the clock handed to the synchronizer follows tokio's
//! clock, so triggers fire exactly when virtual time reaches them.

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use common::{seed_group, seed_unit, RecordingGateway, TokioClock, TZ};
use slotcast::clock::Clock;
use slotcast::control::UnitControl;
use slotcast::error::{Error, Result};
use slotcast::gateway::{GatewayRegistry, RetryConfig, RetryingGateway};
use slotcast::models::{DeletePolicy, NewUnit, SelectionMode, UnitId};
use slotcast::reconciler::{CycleReport, RemovalWorker};
use slotcast::scheduler::{CronSchedule, CycleRunner, JobSynchronizer};
use slotcast::storage::{SqliteStore, Store};

/// Records which unit fired at which virtual instant
struct FiringLog {
    clock: Arc<TokioClock>,
    fired: Mutex<Vec<(UnitId, String)>>,
}

impl FiringLog {
    fn fired(&self) -> Vec<(UnitId, String)> {
        self.fired.lock().unwrap().clone()
    }

    fn count(&self, unit_id: UnitId) -> usize {
        self.fired().iter().filter(|(id, _)| *id == unit_id).count()
    }
}

#[async_trait]
impl CycleRunner for FiringLog {
    async fn run_unit(&self, unit_id: UnitId) -> Result<CycleReport> {
        let at = self.clock.now().format("%H:%M").to_string();
        self.fired.lock().unwrap().push((unit_id, at));
        Ok(CycleReport {
            unit_id,
            skipped: None,
            outcomes: Vec::new(),
            next_offset: None,
        })
    }
}

struct Engine {
    store: Arc<SqliteStore>,
    log: Arc<FiringLog>,
    synchronizer: Arc<JobSynchronizer>,
    control: UnitControl,
}

/// Engine starting at 2024-03-01 08:00:30 Shanghai time
fn engine() -> Engine {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 30).unwrap();
    let clock = Arc::new(TokioClock::new(TZ, base));
    let log = Arc::new(FiringLog {
        clock: clock.clone(),
        fired: Mutex::new(Vec::new()),
    });

    let synchronizer = Arc::new(JobSynchronizer::new(store.clone(), log.clone(), clock.clone()));
    let registry = Arc::new(GatewayRegistry::new(Arc::new(RecordingGateway::new())));
    let gateway = Arc::new(RetryingGateway::new(registry, RetryConfig::immediate(0)));
    let worker = RemovalWorker::new(store.clone(), gateway, clock.clone(), Duration::ZERO);
    let control = UnitControl::new(store.clone(), synchronizer.clone(), worker, clock);

    Engine {
        store,
        log,
        synchronizer,
        control,
    }
}

fn unit_with_cron(store: &SqliteStore, ordinal: u32, cron: &str) -> UnitId {
    let (group, _) = seed_group(store, 1);
    store
        .create_unit(&NewUnit::new(group, ordinal, CronSchedule::parse(cron).unwrap()))
        .unwrap()
}

async fn sleep_minutes(minutes: u64) {
    tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
}

#[tokio::test(start_paused = true)]
async fn test_triggers_fire_at_cron_times() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "*/10 * * * *");

    let report = e.synchronizer.start().await.unwrap();
    assert_eq!(report.scheduled, vec![unit]);
    assert!(report.skipped.is_empty());

    sleep_minutes(25).await;
    assert_eq!(
        e.log.fired(),
        vec![(unit, "08:10".to_string()), (unit, "08:20".to_string())]
    );

    e.synchronizer.shutdown().await;
    sleep_minutes(30).await;
    assert_eq!(e.log.count(unit), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disable_and_reenable_restores_schedule() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "0 9 * * *");
    e.synchronizer.start().await.unwrap();

    let before = e.synchronizer.next_fire(unit).await.unwrap();
    assert_eq!(before.format("%Y-%m-%d %H:%M").to_string(), "2024-03-01 09:00");

    let report = e.control.set_enabled(unit, false).await.unwrap();
    assert!(report.scheduled.is_empty());
    assert!(e.synchronizer.registered_units().await.is_empty());

    // Nothing fires while disabled
    sleep_minutes(90).await;
    assert_eq!(e.log.count(unit), 0);

    let report = e.control.set_enabled(unit, true).await.unwrap();
    assert_eq!(report.scheduled, vec![unit]);
    let after = e.synchronizer.next_fire(unit).await.unwrap();
    assert_eq!(after.format("%Y-%m-%d %H:%M").to_string(), "2024-03-02 09:00");

    sleep_minutes(24 * 60).await;
    assert_eq!(e.log.fired(), vec![(unit, "09:00".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_bad_units_do_not_block_others() {
    let e = engine();
    let good = unit_with_cron(&e.store, 1, "*/15 * * * *");
    let never = unit_with_cron(&e.store, 2, "0 0 30 2 *");
    let (group, _) = seed_group(e.store.as_ref(), 1);
    let disabled = seed_unit(e.store.as_ref(), group, 1, SelectionMode::Random, DeletePolicy::None);
    e.store.set_unit_enabled(disabled, false).unwrap();

    let report = e.synchronizer.sync().await.unwrap();
    assert_eq!(report.scheduled, vec![good]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, never);

    sleep_minutes(20).await;
    assert_eq!(e.log.count(good), 1);
    assert_eq!(e.log.count(never), 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sync_keeps_single_trigger() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "*/10 * * * *");

    for _ in 0..3 {
        e.synchronizer.sync().await.unwrap();
    }
    assert_eq!(e.synchronizer.registered_units().await, vec![unit]);

    sleep_minutes(15).await;
    assert_eq!(e.log.count(unit), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_moves_future_firings() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "0 9 * * *");
    e.synchronizer.start().await.unwrap();

    e.control.reschedule(unit, "30 8 * * *").await.unwrap();
    let next = e.synchronizer.next_fire(unit).await.unwrap();
    assert_eq!(next.format("%H:%M").to_string(), "08:30");

    sleep_minutes(45).await;
    assert_eq!(e.log.fired(), vec![(unit, "08:30".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_reschedule_rejects_invalid_expression() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "0 9 * * *");
    e.synchronizer.start().await.unwrap();

    let err = e.control.reschedule(unit, "61 * * * *").await.unwrap_err();
    assert!(matches!(err, Error::Scheduler(_)));
    assert_eq!(err.category().as_str(), "config");

    // Stored schedule untouched
    let stored = e.store.unit(unit).unwrap().unwrap();
    assert_eq!(stored.publish_cron.expression(), "0 9 * * *");

    let err = e.control.reschedule(404, "0 9 * * *").await.unwrap_err();
    assert!(matches!(err, Error::UnitNotFound(404)));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_unit_loses_trigger() {
    let e = engine();
    let unit = unit_with_cron(&e.store, 1, "*/10 * * * *");
    e.synchronizer.start().await.unwrap();

    let batch = e.control.delete(unit).await.unwrap();
    assert!(batch.is_empty());
    assert!(e.synchronizer.registered_units().await.is_empty());

    sleep_minutes(30).await;
    assert_eq!(e.log.count(unit), 0);
}

/// Runner whose cycle parks until released
#[derive(Default)]
struct ParkedRunner {
    started: Notify,
    release: Notify,
    finished: Notify,
    completed: AtomicUsize,
}

#[async_trait]
impl CycleRunner for ParkedRunner {
    async fn run_unit(&self, unit_id: UnitId) -> Result<CycleReport> {
        self.started.notify_one();
        self.release.notified().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.finished.notify_one();
        Ok(CycleReport {
            unit_id,
            skipped: None,
            outcomes: Vec::new(),
            next_offset: None,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_running_cycle_survives_resync_and_shutdown() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 30).unwrap();
    let clock = Arc::new(TokioClock::new(TZ, base));
    let runner = Arc::new(ParkedRunner::default());
    let synchronizer = JobSynchronizer::new(store.clone(), runner.clone(), clock);
    let unit = unit_with_cron(&store, 1, "*/10 * * * *");

    let report = synchronizer.start().await.unwrap();
    assert_eq!(report.scheduled, vec![unit]);
    runner.started.notified().await;

    // Tear the trigger set down while the cycle is parked
    synchronizer.sync().await.unwrap();
    synchronizer.shutdown().await;
    assert!(synchronizer.registered_units().await.is_empty());
    assert_eq!(runner.completed.load(Ordering::SeqCst), 0);

    runner.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), runner.finished.notified())
        .await
        .expect("cycle did not run to completion");
    assert_eq!(runner.completed.load(Ordering::SeqCst), 1);

    // No new firings after shutdown
    sleep_minutes(30).await;
    assert_eq!(runner.completed.load(Ordering::SeqCst), 1);
}
