//! Fixed-period live polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, error, warn};

use crate::clock_sync::AvoidancePlan;
use crate::config::StationConfig;
use crate::errors::{DriverError, Result};
use crate::host_clock::{sleep_cancellable, CancelToken, HostClock};
use crate::link::Link;
use crate::pipeline::{Outcome, RecordSink, SampleProcessor};
use crate::stations::Station;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous tick has not finished.
    InProgress,
    /// Clearing the avoidance window would take longer than a period.
    Avoidance,
    /// Older than the newest record already handed downstream.
    Stale,
}

/// Result of one live tick.
#[derive(Debug)]
pub enum TickOutcome {
    Recorded(Outcome),
    Skipped(SkipReason),
    Failed(DriverError),
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reads one live sample per tick and pushes it through the pipeline.
#[derive(Debug)]
pub struct LivePoller {
    period: Duration,
    failure_threshold: u32,
    in_progress: Arc<AtomicBool>,
}

impl LivePoller {
    pub fn new(period: Duration, failure_threshold: u32) -> Self {
        Self {
            period,
            failure_threshold,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(config: &StationConfig) -> Self {
        Self::new(config.poll_period(), config.failure_threshold)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Set while a tick runs.
    pub fn in_progress(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.in_progress)
    }

    fn try_begin(&self) -> Option<TickGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TickGuard(&self.in_progress))
    }

    pub fn tick(
        &self,
        station: &mut dyn Station,
        link: &mut Link,
        processor: &mut SampleProcessor,
        sink: &mut dyn RecordSink,
        plan: Option<&AvoidancePlan>,
    ) -> TickOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("live tick skipped, previous still running");
            return TickOutcome::Skipped(SkipReason::InProgress);
        };

        if let Some(plan) = plan {
            let delay = plan.delay_needed(link.clock().now());
            if delay >= self.period {
                warn!("live tick skipped: avoidance delay {:?} exceeds period", delay);
                return TickOutcome::Skipped(SkipReason::Avoidance);
            }
            if !delay.is_zero() {
                debug!("delaying live read by {:?}", delay);
                if let Err(e) = sleep_cancellable(link.clock(), delay, link.cancel()) {
                    return TickOutcome::Failed(e);
                }
            }
        }

        let mut sample = match station.decode_live(link) {
            Ok(sample) => sample,
            Err(e) => return self.failed(link, sink, e),
        };
        let now = link.clock().now();
        link.health().record_success(now);
        sample.timestamp = now;
        sample.interval_seconds = self.period.as_secs() as u32;

        match processor.process(sample, sink) {
            Ok(Outcome::Stale) => TickOutcome::Skipped(SkipReason::Stale),
            Ok(outcome) => TickOutcome::Recorded(outcome),
            Err(e) => {
                error!("live record not handed off: {}", e);
                TickOutcome::Failed(e)
            }
        }
    }

    fn failed(&self, link: &Link, sink: &mut dyn RecordSink, e: DriverError) -> TickOutcome {
        if matches!(e, DriverError::Cancelled) {
            return TickOutcome::Failed(e);
        }
        let now = link.clock().now();
        let health = link.health();
        warn!(
            "live read failed: {}, consecutive={}",
            e,
            health.consecutive_failures() + 1
        );
        if health.record_failure(now, self.failure_threshold) {
            sink.data_stopped(now);
        }
        TickOutcome::Failed(e)
    }
}

/// Fixed-rate schedule. A tick that overruns pushes the next one back
/// instead of queueing a burst.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next_due: Option<NaiveDateTime>,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
        }
    }

    pub fn next_due(&self) -> Option<NaiveDateTime> {
        self.next_due
    }

    /// Block until the next tick is due. The first call returns immediately.
    pub fn wait(&mut self, clock: &dyn HostClock, cancel: &CancelToken) -> Result<()> {
        let now = clock.now();
        let fired = match self.next_due {
            Some(due) if due > now => {
                let wait = (due - now).to_std().unwrap_or_default();
                sleep_cancellable(clock, wait, cancel)?;
                due
            }
            _ => now,
        };
        let period = TimeDelta::from_std(self.period).unwrap_or(TimeDelta::seconds(1));
        self.next_due = Some(fired + period);
        Ok(())
    }
}
