//! Working-hours checks
//!
//! Hours are stored as "HH:MM" strings plus a comma-separated weekday set
//! (Monday = 1) on the tenant and on each queue. A missing window means
//! always open; an end before the start spans midnight.

use chrono::{DateTime, NaiveTime, Utc};

use crate::db::{Queue, Tenant};

/// Whether `now` falls inside the given window
#[must_use]
pub fn within_hours(
    now: DateTime<Utc>,
    start: Option<&str>,
    end: Option<&str>,
    workdays: &str,
) -> bool {
    if !is_workday(now, workdays) {
        return false;
    }

    let (Some(start), Some(end)) = (parse_time(start), parse_time(end)) else {
        // No configured window means always within hours
        return true;
    };

    let time = now.time();
    if start <= end {
        time >= start && time < end
    } else {
        // Overnight window, e.g. 22:00-06:00
        time >= start || time < end
    }
}

/// Whether `now` is inside the tenant's working hours
#[must_use]
pub fn tenant_within_schedule(tenant: &Tenant, now: DateTime<Utc>) -> bool {
    within_hours(
        now,
        tenant.hours_start.as_deref(),
        tenant.hours_end.as_deref(),
        &tenant.workdays,
    )
}

/// Whether `now` is inside the queue's working hours
#[must_use]
pub fn queue_within_schedule(queue: &Queue, now: DateTime<Utc>) -> bool {
    within_hours(
        now,
        queue.hours_start.as_deref(),
        queue.hours_end.as_deref(),
        &queue.workdays,
    )
}

fn is_workday(now: DateTime<Utc>, workdays: &str) -> bool {
    if workdays.trim().is_empty() {
        return true;
    }
    let today = chrono::Datelike::weekday(&now).number_from_monday();
    workdays
        .split(',')
        .filter_map(|day| day.trim().parse::<u32>().ok())
        .any(|day| day == today)
}

fn parse_time(value: Option<&str>) -> Option<NaiveTime> {
    let value = value?.trim();
    let (hours, minutes) = value.split_once(':')?;
    NaiveTime::from_hms_opt(hours.parse().ok()?, minutes.parse().ok()?, 0)
}
