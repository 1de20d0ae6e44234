//! Per-record processing shared by backfill and live polling.
//!
//! Every record goes through the same steps in the same order: bounds
//! validation, day rollover, midnight reset, accumulator update, hand-off.

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::accumulators::{AccumulationSettings, Accumulators, DaySummary};
use crate::config::StationConfig;
use crate::errors::Result;
use crate::rollover::RolloverState;
use crate::sample::Sample;
use crate::validation::{sanitize, SanityBounds};

/// Downstream consumer of processed records (persistence, derived metrics).
pub trait RecordSink: Send {
    /// One validated record with the totals it produced.
    fn record(&mut self, sample: &Sample, totals: &Accumulators) -> Result<()>;

    /// A weather day closed.
    fn day_closed(&mut self, _summary: &DaySummary) -> Result<()> {
        Ok(())
    }

    /// Calendar midnight passed.
    fn midnight_reset(&mut self, _date: NaiveDate) -> Result<()> {
        Ok(())
    }

    /// The link crossed the failure threshold.
    fn data_stopped(&mut self, _since: NaiveDateTime) {}
}

/// Everything a session must persist to resume exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Timestamp of the newest record handed downstream.
    pub last_update: Option<NaiveDateTime>,
    pub rollover: RolloverState,
    pub accumulators: Accumulators,
}

impl SessionState {
    pub fn new(config: &StationConfig) -> Self {
        Self {
            last_update: None,
            rollover: RolloverState::new(config.rollover_hour, config.dst_adjust),
            accumulators: Accumulators::default(),
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Recorded {
        rejected_fields: usize,
        day_closed: bool,
        midnight_reset: bool,
    },
    /// Older than the last record handed downstream; dropped.
    Stale,
}

pub struct SampleProcessor {
    state: SessionState,
    bounds: SanityBounds,
    settings: AccumulationSettings,
    dst_from_host: bool,
}

impl SampleProcessor {
    pub fn new(config: &StationConfig, state: Option<SessionState>) -> Self {
        let mut state = state.unwrap_or_else(|| SessionState::new(config));
        state.rollover.rollover_hour = config.rollover_hour;
        state.rollover.dst_adjust = config.dst_adjust;
        Self {
            state,
            bounds: config.bounds.clone(),
            settings: config.accumulation.clone(),
            dst_from_host: true,
        }
    }

    /// Treat daylight saving time as never active, whatever the host zone says.
    pub fn without_host_dst(mut self) -> Self {
        self.dst_from_host = false;
        self
    }

    pub fn last_update(&self) -> Option<NaiveDateTime> {
        self.state.last_update
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn accumulators(&self) -> &Accumulators {
        &self.state.accumulators
    }

    /// Run one record through validation, transitions, accumulation and
    /// hand-off. Each transition and the record itself are committed only
    /// once the sink accepted them.
    pub fn process(&mut self, mut sample: Sample, sink: &mut dyn RecordSink) -> Result<Outcome> {
        if let Some(last) = self.state.last_update {
            if sample.timestamp < last {
                debug!("dropping stale record: time={}, last={}", sample.timestamp, last);
                return Ok(Outcome::Stale);
            }
        }

        let report = sanitize(&mut sample, &self.bounds);

        let mut rollover = self.state.rollover.clone();
        let transitions = if self.dst_from_host {
            rollover.observe(sample.timestamp)
        } else {
            rollover.observe_with(sample.timestamp, false)
        };
        let mut totals = self.state.accumulators.clone();

        if let Some(closed) = transitions.day_closed {
            let opened = rollover.current_day.unwrap_or(closed);
            let summary = totals.close_day(closed, opened, &self.settings);
            sink.day_closed(&summary)?;
            info!(
                "day closed: date={}, rain={:.1}mm, wind_run={:.1}km",
                summary.date, summary.rain_mm, summary.wind_run_km
            );
            self.state.rollover.current_day = rollover.current_day;
            self.state.accumulators = totals.clone();
        }
        if let Some(date) = transitions.midnight {
            totals.reset_midnight();
            sink.midnight_reset(date)?;
            self.state.rollover.last_midnight = rollover.last_midnight;
            self.state.accumulators = totals.clone();
        }

        totals.apply(&sample, &self.settings);
        sink.record(&sample, &totals)?;
        self.state.rollover = rollover;
        self.state.accumulators = totals;
        self.state.last_update = Some(sample.timestamp);

        Ok(Outcome::Recorded {
            rejected_fields: report.rejected,
            day_closed: transitions.day_closed.is_some(),
            midnight_reset: transitions.midnight.is_some(),
        })
    }
}
