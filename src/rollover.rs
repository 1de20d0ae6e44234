//! Day-rollover and midnight-reset detection.
//!
//! Both transitions use the same latch, keyed on the date of the last
//! transition: one fires the first time a record falls in the trigger hour of
//! a newer day, and further records of that dwell see the same date and do
//! nothing. When the host was down across the whole trigger hour the
//! transition is still applied, once, by the first record of a later day.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use log::debug;
use serde::{Deserialize, Serialize};

/// Transitions produced by one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transitions {
    /// Weather day that closed before this record.
    pub day_closed: Option<NaiveDate>,
    /// Calendar date whose midnight reset applies before this record.
    pub midnight: Option<NaiveDate>,
}

impl Transitions {
    pub fn is_empty(&self) -> bool {
        self.day_closed.is_none() && self.midnight.is_none()
    }
}

/// Rollover bookkeeping carried across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverState {
    pub rollover_hour: u32,
    pub dst_adjust: bool,
    /// Weather day currently being accumulated.
    pub current_day: Option<NaiveDate>,
    /// Calendar date of the last midnight reset.
    pub last_midnight: Option<NaiveDate>,
}

impl RolloverState {
    pub fn new(rollover_hour: u32, dst_adjust: bool) -> Self {
        Self {
            rollover_hour,
            dst_adjust,
            current_day: None,
            last_midnight: None,
        }
    }

    /// Observe a record at `timestamp`, using the host time zone for DST.
    pub fn observe(&mut self, timestamp: NaiveDateTime) -> Transitions {
        let dst_active = self.dst_adjust && local_is_dst(timestamp);
        self.observe_with(timestamp, dst_active)
    }

    /// Observe a record with an explicit daylight-saving flag.
    pub fn observe_with(&mut self, timestamp: NaiveDateTime, dst_active: bool) -> Transitions {
        let hour = self.effective_hour(dst_active);
        let weather_day = weather_day(timestamp, hour);
        let mut transitions = Transitions::default();

        let previous_day = self.current_day;
        if latch(&mut self.current_day, weather_day) {
            if let Some(closed) = previous_day {
                debug!("day rollover: closed={}, at={}", closed, timestamp);
                transitions.day_closed = Some(closed);
            }
        }

        let date = timestamp.date();
        if latch(&mut self.last_midnight, date) {
            debug!("midnight reset: date={}", date);
            transitions.midnight = Some(date);
        }

        transitions
    }

    /// Rollover hour in effect; a non-midnight rollover moves one hour later
    /// during daylight saving time.
    pub fn effective_hour(&self, dst_active: bool) -> u32 {
        if dst_active && self.rollover_hour != 0 {
            (self.rollover_hour + 1) % 24
        } else {
            self.rollover_hour
        }
    }
}

/// Weather day a record belongs to: records before the rollover hour count
/// toward the previous calendar day.
pub fn weather_day(timestamp: NaiveDateTime, rollover_hour: u32) -> NaiveDate {
    (timestamp - TimeDelta::hours(i64::from(rollover_hour))).date()
}

/// Fires when `day` is newer than the last transition. Inside the trigger
/// hour that is the normal case; outside it, it catches up a trigger hour the
/// host missed. The first record ever seen only establishes the baseline.
fn latch(last: &mut Option<NaiveDate>, day: NaiveDate) -> bool {
    let fire = last.map_or(false, |previous| day > previous);
    if fire || last.is_none() {
        *last = Some(day);
    }
    fire
}

/// Whether daylight saving time is in effect at `timestamp` in the host zone.
fn local_is_dst(timestamp: NaiveDateTime) -> bool {
    let offset_at = |at: NaiveDateTime| {
        Local
            .offset_from_local_datetime(&at)
            .earliest()
            .map(|o| o.local_minus_utc())
    };
    let year = timestamp.year();
    let probe = |month| {
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .and_then(offset_at)
    };
    match (offset_at(timestamp), probe(1), probe(7)) {
        (Some(now), Some(january), Some(july)) if january != july => now == january.max(july),
        _ => false,
    }
}
