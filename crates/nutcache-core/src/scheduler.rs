//! Wall-clock rollup boundaries.
//!
//! Three independent timers: minute rollups, hourly power, daily power. Each
//! is initialized lazily from the wall clock (never from a sample timestamp)
//! and only ever moves forward. After a boundary is used the timer advances
//! to `max(boundary + period, next aligned boundary after now)`: one period
//! in steady state, and a resync instead of a burst of catch-up rollups after
//! a stall.

use chrono::{DateTime, Duration, DurationRound, NaiveTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

/// First whole minute strictly after `now`.
pub fn next_whole_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate(now, TimeDelta::minutes(1)) + Duration::minutes(1)
}

/// First whole hour strictly after `now`.
pub fn next_whole_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    truncate(now, TimeDelta::hours(1)) + Duration::hours(1)
}

/// Today's `hour`:00 UTC if `now` has not reached that hour yet, else
/// tomorrow's.
pub fn next_daily_boundary(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(time).and_utc();
    if now < today {
        today
    } else {
        today + Duration::days(1)
    }
}

/// UTC midnight of the day containing `now`.
pub fn midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn truncate(now: DateTime<Utc>, unit: TimeDelta) -> DateTime<Utc> {
    now.duration_trunc(unit).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerState {
    pub next_minute_boundary: Option<DateTime<Utc>>,
    pub next_hour_boundary: Option<DateTime<Utc>>,
    pub next_daily_boundary: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RollupScheduler {
    daily_hour: u32,
    next_minute: Option<DateTime<Utc>>,
    next_hour: Option<DateTime<Utc>>,
    next_daily: Option<DateTime<Utc>>,
}

impl RollupScheduler {
    pub fn new(daily_hour: u32) -> Self {
        Self {
            daily_hour,
            next_minute: None,
            next_hour: None,
            next_daily: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            next_minute_boundary: self.next_minute,
            next_hour_boundary: self.next_hour,
            next_daily_boundary: self.next_daily,
        }
    }

    /// Arms the minute and hour timers on the first ingestion.
    pub fn prime(&mut self, now: DateTime<Utc>) {
        if self.next_minute.is_none() {
            let boundary = next_whole_minute(now);
            info!(next_save = %boundary, "first sample received, minute rollups armed");
            self.next_minute = Some(boundary);
        }
        if self.next_hour.is_none() {
            self.next_hour = Some(next_whole_hour(now));
        }
    }

    /// The minute boundary to roll up, if the wall clock has reached it.
    /// Repeated calls return the same boundary until it is advanced.
    pub fn minute_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let boundary = *self.next_minute.get_or_insert_with(|| next_whole_minute(now));
        (now >= boundary).then_some(boundary)
    }

    pub fn hour_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let boundary = *self.next_hour.get_or_insert_with(|| next_whole_hour(now));
        (now >= boundary).then_some(boundary)
    }

    /// First call only arms the timer.
    pub fn daily_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.next_daily {
            None => {
                let boundary = next_daily_boundary(now, self.daily_hour);
                info!(next_daily = %boundary, "daily aggregation armed");
                self.next_daily = Some(boundary);
                None
            }
            Some(boundary) => (now >= boundary).then_some(boundary),
        }
    }

    pub fn advance_minute(&mut self, now: DateTime<Utc>) {
        self.next_minute = Some(advance(self.next_minute, Duration::minutes(1), next_whole_minute(now)));
    }

    pub fn advance_hour(&mut self, now: DateTime<Utc>) {
        self.next_hour = Some(advance(self.next_hour, Duration::hours(1), next_whole_hour(now)));
    }

    pub fn advance_daily(&mut self, now: DateTime<Utc>) {
        let aligned = next_daily_boundary(now, self.daily_hour);
        self.next_daily = Some(advance(self.next_daily, Duration::days(1), aligned));
    }
}

fn advance(current: Option<DateTime<Utc>>, period: Duration, aligned: DateTime<Utc>) -> DateTime<Utc> {
    match current {
        Some(boundary) => (boundary + period).max(aligned),
        None => aligned,
    }
}
