use anyhow::{Context, Result};
use tokio::sync::watch;

use slotcast::app::Services;
use slotcast::config::Config;

/// Run the trigger engine and expiry sweeper until Ctrl-C
pub async fn run(config: &Config) -> Result<()> {
    let services = Services::build(config)?;

    let report = services
        .synchronizer
        .start()
        .await
        .context("Failed to start trigger engine")?;

    println!("slotcast scheduler running");
    println!("==========================");
    println!("  Timezone: {}", config.scheduler.timezone);
    println!("  Scheduled units: {}", report.scheduled.len());
    for (unit_id, reason) in &report.skipped {
        println!("  Skipped unit {unit_id}: {reason}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = services.spawn_sweeper(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    shutdown_tx.send(true).ok();
    services.shutdown().await;
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Expiry sweeper ended abnormally");
    }

    println!("Scheduler stopped");
    Ok(())
}
