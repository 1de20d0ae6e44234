//! Chronological replay of history read newest-first.

use log::{error, info};

use crate::errors::Result;
use crate::log_reader::LogEntry;
use crate::pipeline::{Outcome, RecordSink, SampleProcessor};

/// Counters of one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Entries the log reader returned.
    pub read: usize,
    /// Entries handed downstream.
    pub applied: usize,
    /// Entries at or before the last update.
    pub skipped: usize,
    pub rejected_fields: usize,
    pub day_closes: usize,
    pub midnight_resets: usize,
}

/// Replays log entries through a [`SampleProcessor`], oldest first.
pub struct Sequencer<'a> {
    processor: &'a mut SampleProcessor,
}

impl<'a> Sequencer<'a> {
    pub fn new(processor: &'a mut SampleProcessor) -> Self {
        Self { processor }
    }

    /// Hand every entry newer than the processor's last update downstream in
    /// time order. A failing entry stops the run; entries before it stay
    /// applied and the next run resumes after them.
    pub fn replay(
        &mut self,
        entries: Vec<LogEntry>,
        sink: &mut dyn RecordSink,
    ) -> Result<BackfillReport> {
        let mut report = BackfillReport {
            read: entries.len(),
            ..BackfillReport::default()
        };

        let cutoff = self.processor.last_update();
        let mut pending: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp > c))
            .collect();
        report.skipped = report.read - pending.len();

        // Reader output is newest first; reversing before the stable sort keeps
        // equal timestamps in the order they were written.
        pending.reverse();
        pending.sort_by_key(|e| e.timestamp);

        let total = pending.len();
        for entry in pending {
            let mut sample = entry.sample;
            sample.timestamp = entry.timestamp;
            match self.processor.process(sample, sink) {
                Ok(Outcome::Recorded {
                    rejected_fields,
                    day_closed,
                    midnight_reset,
                }) => {
                    report.applied += 1;
                    report.rejected_fields += rejected_fields;
                    report.day_closes += usize::from(day_closed);
                    report.midnight_resets += usize::from(midnight_reset);
                }
                Ok(Outcome::Stale) => report.skipped += 1,
                Err(e) => {
                    error!(
                        "backfill aborted: applied={}/{}, at={}, error={}",
                        report.applied, total, entry.timestamp, e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            "backfill complete: applied={}, skipped={}, day_closes={}",
            report.applied, report.skipped, report.day_closes
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDateTime, TimeDelta};

    use super::*;
    use crate::host_clock::HostClock;
    use crate::pipeline::tests::{processor, CollectingSink};
    use crate::sample::Sample;
    use crate::test_utils::clock_at;

    fn entry(timestamp: NaiveDateTime, speed: f64) -> LogEntry {
        let mut sample = Sample::new(timestamp);
        sample.interval_seconds = 600;
        sample.wind_speed = Some(speed);
        LogEntry {
            address: 0x100,
            interval_minutes: 10,
            timestamp,
            sample,
        }
    }

    /// Newest-first entries every ten minutes ending at `end`.
    fn newest_first(end: NaiveDateTime, count: i64) -> Vec<LogEntry> {
        (0..count)
            .map(|i| entry(end - TimeDelta::minutes(10 * i), 1.0))
            .collect()
    }

    #[test]
    fn test_replays_in_chronological_order() {
        let end = clock_at(2024, 7, 1, 12, 0).now();
        let mut entries = newest_first(end, 6);
        entries.swap(1, 4);

        let mut processor = processor(0);
        let mut sink = CollectingSink::default();
        let report = Sequencer::new(&mut processor).replay(entries, &mut sink).unwrap();

        assert_eq!(6, report.applied);
        let times: Vec<_> = sink.records.iter().map(|(s, _)| s.timestamp).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "{times:?}");
        assert_eq!(Some(end), processor.last_update());
    }

    #[test]
    fn test_second_run_applies_nothing() {
        let end = clock_at(2024, 7, 1, 12, 0).now();
        let mut processor = processor(0);
        let mut sink = CollectingSink::default();

        let first = Sequencer::new(&mut processor)
            .replay(newest_first(end, 5), &mut sink)
            .unwrap();
        let second = Sequencer::new(&mut processor)
            .replay(newest_first(end, 5), &mut sink)
            .unwrap();

        assert_eq!(5, first.applied);
        assert_eq!(0, second.applied);
        assert_eq!(5, second.skipped);
        assert_eq!(5, sink.records.len());
    }

    #[test]
    fn test_rollover_hour_closes_day_once() {
        // Rollover at 09:00; entries every ten minutes from 08:00 to 10:50.
        let end = clock_at(2024, 7, 1, 10, 50).now();
        let mut processor = processor(9);
        let mut sink = CollectingSink::default();

        let report = Sequencer::new(&mut processor)
            .replay(newest_first(end, 18), &mut sink)
            .unwrap();

        assert_eq!(1, report.day_closes);
        assert_eq!(1, sink.days.len());
        assert_eq!(end.date().pred_opt().unwrap(), sink.days[0].date);
        // 08:00-08:50 belong to the closed day.
        assert!((sink.days[0].wind_run_km - 6.0 * 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_sink_failure_aborts_remainder_only() {
        let end = clock_at(2024, 7, 1, 12, 0).now();
        let mut processor = processor(0);
        let mut sink = CollectingSink {
            fail_after: Some(3),
            ..CollectingSink::default()
        };

        let result = Sequencer::new(&mut processor).replay(newest_first(end, 6), &mut sink);
        assert!(result.is_err());
        assert_eq!(3, sink.records.len());
        assert_eq!(Some(end - TimeDelta::minutes(30)), processor.last_update());

        // Once the sink recovers, the next run picks up exactly where it stopped.
        sink.fail_after = None;
        let report = Sequencer::new(&mut processor)
            .replay(newest_first(end, 6), &mut sink)
            .unwrap();
        assert_eq!(3, report.applied);
        assert_eq!(3, report.skipped);
        assert_eq!(6, sink.records.len());
    }
}
