//! Activity counters over the append-only metrics log.
//!
//! RULE: bucketing happens in the configured local offset, never in UTC.
//! A sale at 23:30 UTC belongs to tomorrow in UTC+7.

use crate::types::CustomerId;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One paid account creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub customer_id: CustomerId,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub today: u64,
    pub week: u64,
    pub month: u64,
}

/// Count events falling on the same calendar day, ISO week and calendar
/// month as `now`. Events in the future relative to `now` are still
/// bucketed by their date.
pub fn compute_metrics(events: &[MetricsEvent], now: DateTime<FixedOffset>) -> ActivityCounts {
    let offset = *now.offset();
    let today = now.date_naive();
    let this_week = today.iso_week();

    let mut counts = ActivityCounts::default();
    for event in events {
        let date = event.recorded_at.with_timezone(&offset).date_naive();
        if date == today {
            counts.today += 1;
        }
        if date.iso_week() == this_week {
            counts.week += 1;
        }
        if date.year() == today.year() && date.month() == today.month() {
            counts.month += 1;
        }
    }
    counts
}

/// Earliest instant any bucket of `compute_metrics` can reach back to:
/// local midnight at the start of the ISO week or the month, whichever is earlier.
pub fn window_start(now: DateTime<FixedOffset>) -> DateTime<Utc> {
    let today = now.date_naive();
    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let earliest = week_start.min(month_start);
    let midnight = earliest.and_time(chrono::NaiveTime::MIN);
    now.offset()
        .from_local_datetime(&midnight)
        .single()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}
