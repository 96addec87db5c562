//! Five-field cron expressions
//!
//! Fields are `minute hour day-of-month month day-of-week`, evaluated in the
//! timezone of the instant passed to [`CronSchedule::next_after`]. Matching
//! and next-fire computation are delegated to [`cron::Schedule`]; this type
//! only maps the five-field dialect onto it.
//!
//! Weekdays use the crontab numbering, `0` and `7` both Sunday, or three
//! letter names. When both day fields are restricted a day must match both.

use chrono::{DateTime, TimeZone};
use cron::Schedule;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::error::SchedulerError;

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parsed cron schedule
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a five-field expression or one of the `@` shorthands
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::invalid_cron(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }
        if let Some(field) = fields.iter().find(|f| has_zero_step(f)) {
            return Err(SchedulerError::invalid_cron(
                expression,
                format!("step must be positive in '{field}'"),
            ));
        }

        let weekdays = weekday_field(fields[4])
            .map_err(|e| SchedulerError::invalid_cron(expression, format!("day-of-week: {e}")))?;

        // cron::Schedule wants a leading seconds field
        let source = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], weekdays
        );
        let schedule = Schedule::from_str(&source)
            .map_err(|e| SchedulerError::invalid_cron(expression, e.to_string()))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as written
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next firing strictly after `after`, in the same timezone.
    ///
    /// Returns `None` when the expression never fires again.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// The next `count` firings after `after`
    pub fn upcoming<Tz: TimeZone>(&self, after: &DateTime<Tz>, count: usize) -> Vec<DateTime<Tz>> {
        self.schedule.after(after).take(count).collect()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronSchedule {}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn has_zero_step(field: &str) -> bool {
    field
        .split(',')
        .filter_map(|part| part.split_once('/'))
        .any(|(_, step)| step.parse::<u32>() == Ok(0))
}

/// Rewrite a crontab weekday field (Sunday = 0 or 7) as day names, which
/// `cron::Schedule` reads without the numbering ambiguity.
fn weekday_field(field: &str) -> Result<String, String> {
    if field == "*" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (weekday(a)?, weekday(b)?);
            if a > b {
                return Err(format!("range {range} is reversed"));
            }
            (a, b)
        } else {
            let value = weekday(range)?;
            if step.is_some() {
                (value, 7)
            } else {
                (value, value)
            }
        };

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }

    let names: Vec<&str> = days.into_iter().map(|d| WEEKDAY_NAMES[d]).collect();
    Ok(names.join(","))
}

fn weekday(token: &str) -> Result<usize, String> {
    if let Some(index) = WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
    {
        return Ok(index);
    }
    match token.parse::<usize>() {
        Ok(value) if value <= 7 => Ok(value),
        Ok(value) => Err(format!("{value} is out of range 0-7")),
        Err(_) => Err(format!("'{token}' is not a weekday")),
    }
}
