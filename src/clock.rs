//! Time source abstraction
//!
//! Everything that needs "now" goes through [`Clock`] so tests can pin time
//! and cron evaluation uses the configured timezone.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::Mutex;

/// Source of the current instant plus the timezone cron expressions use
pub trait Clock: Send + Sync {
    fn timezone(&self) -> Tz;

    fn now_utc(&self) -> DateTime<Utc>;

    /// Current instant in the configured timezone
    fn now(&self) -> DateTime<Tz> {
        self.now_utc().with_timezone(&self.timezone())
    }

    /// Local calendar date, used to seed the daily rotation
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock in a fixed timezone
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn timezone(&self) -> Tz {
        self.tz
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and dry runs
#[derive(Debug)]
pub struct FixedClock {
    tz: Tz,
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            tz,
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let current = self.now_utc();
        self.set(current + by);
    }
}

impl Clock for FixedClock {
    fn timezone(&self) -> Tz {
        self.tz
    }

    fn now_utc(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_today_uses_local_timezone() {
        // 2024-03-01 20:00 UTC is already 2024-03-02 in Shanghai
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        let clock = FixedClock::new(chrono_tz::Asia::Shanghai, now);

        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());

        let utc_clock = FixedClock::new(chrono_tz::UTC, now);
        assert_eq!(utc_clock.today(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_fixed_clock_advance() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(chrono_tz::UTC, now);
        clock.advance(chrono::Duration::minutes(90));

        assert_eq!(clock.now_utc(), Utc.with_ymd_and_hms(2024, 3, 1, 1, 30, 0).unwrap());
    }
}
