use anyhow::{Context, Result};
use chrono::Utc;

use slotcast::config::Config;
use slotcast::scheduler::{plan_triggers, CronSchedule};
use slotcast::storage::{SqliteStore, Store};

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::new(&config.database.sqlite_path).with_context(|| {
        format!(
            "Failed to open database: {}",
            config.database.sqlite_path.display()
        )
    })
}

/// Report which units a sync would schedule, without starting anything
pub fn sync(config: &Config) -> Result<()> {
    let tz = config.timezone()?;
    let store = open_store(config)?;
    let now = Utc::now().with_timezone(&tz);

    let (planned, skipped) = plan_triggers(store.enabled_units()?, &now);

    println!("Trigger plan ({tz})");
    println!("==================");
    if planned.is_empty() {
        println!("  No units would be scheduled");
    }
    for trigger in &planned {
        println!(
            "  {:<32} {:<20} next: {}",
            trigger.unit.label(),
            trigger.unit.publish_cron.expression(),
            trigger.next_fire.format("%Y-%m-%d %H:%M %Z")
        );
    }

    if !skipped.is_empty() {
        println!();
        println!("Skipped units:");
        for (unit_id, reason) in &skipped {
            println!("  unit {unit_id}: {reason}");
        }
    }

    Ok(())
}

/// Validate a cron expression and print its next firings
pub fn cron(config: &Config, expression: &str, count: usize) -> Result<()> {
    let tz = config.timezone()?;
    let schedule = CronSchedule::parse(expression)?;
    let now = Utc::now().with_timezone(&tz);
    let firings = schedule.upcoming(&now, count);

    println!("'{schedule}' in {tz}");
    if firings.is_empty() {
        println!("  Never fires");
    }
    for (i, at) in firings.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, at.format("%Y-%m-%d %H:%M %a %Z"));
    }

    Ok(())
}

/// Print the most recent audit records
pub fn audit(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store.recent_audit(limit)?;

    if records.is_empty() {
        println!("No audit records");
        return Ok(());
    }

    for record in &records {
        println!("{record}");
    }
    println!();
    println!(
        "{} records, {} failed",
        records.len(),
        records.iter().filter(|r| !r.is_success()).count()
    );

    Ok(())
}
