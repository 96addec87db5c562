use anyhow::Result;

use slotcast::app::Services;
use slotcast::config::Config;
use slotcast::models::UnitId;
use slotcast::reconciler::ApplyOutcome;

/// Run one publication cycle for a unit right now
pub async fn fire(config: &Config, unit_id: UnitId) -> Result<()> {
    let services = Services::build(config)?;
    let report = services.reconciler.run_cycle(unit_id).await?;

    println!("Cycle for unit {unit_id}");
    println!("==================");
    if let Some(reason) = report.skipped {
        println!("  Skipped: {reason:?}");
        services.shutdown().await;
        return Ok(());
    }

    for (destination_id, outcome) in &report.outcomes {
        match outcome {
            ApplyOutcome::Published {
                content_id,
                message,
            } => println!("  dest {destination_id}: published content {content_id} as message {message}"),
            ApplyOutcome::Skipped(reason) => println!("  dest {destination_id}: skipped ({reason:?})"),
            ApplyOutcome::Failed { category, error } => {
                println!("  dest {destination_id}: FAILED [{}] {error}", category.as_str())
            }
        }
    }
    println!(
        "  Published: {}  Failed: {}",
        report.published(),
        report.failed()
    );
    if let Some(offset) = report.next_offset {
        println!("  Next rotation offset: {offset}");
    }

    services.shutdown().await;
    Ok(())
}

/// Clear a unit's live posts and wait for the remote removals
pub async fn clear(config: &Config, unit_id: UnitId) -> Result<()> {
    let services = Services::build(config)?;
    let batch = services.control.clear(unit_id)?;

    println!("Cleared unit {unit_id}: {} posts queued for removal", batch.len());
    let report = batch.wait().await;
    println!(
        "  Removed: {}  Failed: {}",
        report.removed, report.failed
    );

    services.shutdown().await;
    Ok(())
}
