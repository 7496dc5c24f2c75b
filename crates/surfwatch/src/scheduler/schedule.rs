//! Rescan schedules and next-run computation.

use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// How often a target is rescanned. The stored values are cron-like
/// strings and must be kept exactly as they are.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanSchedule {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "0_0_*_*_*")]
    Daily,
    #[serde(rename = "0_0_*/3_*_*")]
    Every3Days,
    #[serde(rename = "0_0_*_*_0")]
    Weekly,
    #[serde(rename = "0_0_*/14_*_*")]
    Every2Weeks,
    #[serde(rename = "0_0_1_*_*")]
    Monthly,
}

impl ScanSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanSchedule::Disabled => "disabled",
            ScanSchedule::Daily => "0_0_*_*_*",
            ScanSchedule::Every3Days => "0_0_*/3_*_*",
            ScanSchedule::Weekly => "0_0_*_*_0",
            ScanSchedule::Every2Weeks => "0_0_*/14_*_*",
            ScanSchedule::Monthly => "0_0_1_*_*",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(ScanSchedule::Disabled),
            "0_0_*_*_*" => Some(ScanSchedule::Daily),
            "0_0_*/3_*_*" => Some(ScanSchedule::Every3Days),
            "0_0_*_*_0" => Some(ScanSchedule::Weekly),
            "0_0_*/14_*_*" => Some(ScanSchedule::Every2Weeks),
            "0_0_1_*_*" => Some(ScanSchedule::Monthly),
            _ => None,
        }
    }

    /// When a target last discovered at `last` is due again. `None` for
    /// disabled schedules.
    pub fn next_run(&self, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScanSchedule::Disabled => None,
            ScanSchedule::Daily => last.checked_add_signed(Duration::days(1)),
            ScanSchedule::Every3Days => last.checked_add_signed(Duration::days(3)),
            ScanSchedule::Weekly => last.checked_add_signed(Duration::days(7)),
            ScanSchedule::Every2Weeks => last.checked_add_signed(Duration::days(14)),
            ScanSchedule::Monthly => last.checked_add_months(Months::new(1)),
        }
    }

    /// Whether a scan should start at `now`. Targets that were never
    /// discovered are due right away.
    pub fn is_due(&self, last_discovered_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if *self == ScanSchedule::Disabled {
            return false;
        }
        match last_discovered_at {
            None => true,
            Some(last) => self.next_run(last).is_some_and(|next| next <= now),
        }
    }
}

impl fmt::Display for ScanSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
