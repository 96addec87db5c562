//! Service wiring
//!
//! Builds the object graph once from a [`Config`] so the binary and the
//! integration tests assemble the engine the same way.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::control::UnitControl;
use crate::gateway::retry::RetryingGateway;
use crate::gateway::telegram::TelegramGateway;
use crate::gateway::{Gateway, GatewayRegistry};
use crate::reconciler::cleanup::{ExpirySweeper, RemovalWorker};
use crate::reconciler::PlacementReconciler;
use crate::scheduler::trigger::JobSynchronizer;
use crate::storage::{SqliteStore, Store};

/// The assembled engine
pub struct Services {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub gateway: Arc<RetryingGateway>,
    pub reconciler: Arc<PlacementReconciler>,
    pub worker: RemovalWorker,
    pub sweeper: Arc<ExpirySweeper>,
    pub synchronizer: Arc<JobSynchronizer>,
    pub control: UnitControl,
}

impl Services {
    /// Open the configured database and connect to the Bot API
    pub fn build(config: &Config) -> Result<Self> {
        let store = SqliteStore::new(&config.database.sqlite_path).with_context(|| {
            format!(
                "Failed to open database: {}",
                config.database.sqlite_path.display()
            )
        })?;
        let clock = SystemClock::new(config.timezone()?);
        let gateway = TelegramGateway::new(config.gateway.telegram.clone())
            .context("Failed to create Telegram gateway")?;

        Ok(Self::assemble(
            config,
            Arc::new(store),
            Arc::new(gateway),
            Arc::new(clock),
        ))
    }

    /// Wire the engine around an existing store, platform client and clock
    pub fn assemble(
        config: &Config,
        store: Arc<dyn Store>,
        gateway: Arc<dyn Gateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(GatewayRegistry::new(gateway));
        let gateway = Arc::new(RetryingGateway::new(registry, config.retry_config()));

        let reconciler = Arc::new(PlacementReconciler::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            config.reconciler_config(),
        ));
        let worker = RemovalWorker::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            config.removal_pause(),
        );
        let sweeper = Arc::new(ExpirySweeper::new(
            store.clone(),
            worker.clone(),
            clock.clone(),
            config.sweep_interval(),
        ));
        let synchronizer = Arc::new(JobSynchronizer::new(
            store.clone(),
            reconciler.clone(),
            clock.clone(),
        ));
        let control = UnitControl::new(
            store.clone(),
            synchronizer.clone(),
            worker.clone(),
            clock.clone(),
        );

        Self {
            store,
            clock,
            gateway,
            reconciler,
            worker,
            sweeper,
            synchronizer,
            control,
        }
    }

    /// Start the expiry sweeper on its own task
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = self.sweeper.clone();
        info!("Starting expiry sweeper");
        tokio::spawn(async move { sweeper.run(shutdown).await })
    }

    /// Stop triggers and release the platform client
    pub async fn shutdown(&self) {
        self.synchronizer.shutdown().await;
        self.gateway.registry().current().await.close().await;
    }
}
