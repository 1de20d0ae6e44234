//! Device clock synchronisation.
//!
//! Consoles refresh their live block on internal clocks the host cannot see:
//! a sensor tick (every 48 s on HID consoles), a console minute, a solar
//! tick. Reading memory while the console is writing it returns torn data,
//! so the session first learns when each tick happens by watching the live
//! block change, then keeps reads out of a small window around every tick.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use log::{debug, info, warn};

use crate::config::ClockSettings;
use crate::errors::{DriverError, Result};
use crate::host_clock::{sleep_cancellable, HostClock};
use crate::link::Link;

/// Epochs older than this are recalibrated.
const EPOCH_MAX_AGE: TimeDelta = TimeDelta::days(1);

/// Internal device clocks that can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    SensorTick,
    ConsoleMinute,
    SolarTick,
}

/// Where a tick shows up and how often it recurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickRegion {
    pub kind: TickKind,
    /// Bytes of the sampled block that change on this tick. Ignored for
    /// [`TickKind::ConsoleMinute`], which is read from the write pointer.
    pub bytes: Range<usize>,
    pub period_secs: i64,
    /// Synchronisation only counts as successful once this tick was seen.
    pub required: bool,
}

/// One high-frequency sample of the live block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSample {
    pub bytes: Vec<u8>,
    pub write_pointer: Option<u16>,
}

/// A device family that exposes observable clock ticks.
pub trait ClockProbe {
    fn tick_regions(&self) -> Vec<TickRegion>;
    fn sample_block(&mut self, link: &mut Link) -> Result<ProbeSample>;
}

/// Last observed instant of one device clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEpoch {
    pub last_known_instant: NaiveDateTime,
    /// Phase shift since the previous calibration, in seconds.
    pub drift_seconds: i64,
    /// Never observed; aligned to the host minute instead.
    pub assumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Synchronizing,
    Done,
    Fallback,
}

/// Owns the epochs of one session.
#[derive(Debug)]
pub struct ClockSynchronizer {
    settings: ClockSettings,
    state: SyncState,
    epochs: HashMap<TickKind, ClockEpoch>,
    periods: HashMap<TickKind, i64>,
    calibrated_at: Option<NaiveDateTime>,
}

impl ClockSynchronizer {
    pub fn new(settings: ClockSettings) -> Self {
        Self {
            settings,
            state: SyncState::Idle,
            epochs: HashMap::new(),
            periods: HashMap::new(),
            calibrated_at: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn epoch(&self, kind: TickKind) -> Option<&ClockEpoch> {
        self.epochs.get(&kind)
    }

    /// True before the first calibration and once the last one is a day old.
    pub fn needs_calibration(&self, now: NaiveDateTime) -> bool {
        match (self.state, self.calibrated_at) {
            (SyncState::Idle, _) | (_, None) => true,
            (_, Some(at)) => now - at > EPOCH_MAX_AGE,
        }
    }

    /// Watch the live block until every tick was seen, the time box expires,
    /// or probing keeps failing.
    pub fn synchronize(&mut self, probe: &mut dyn ClockProbe, link: &mut Link) -> SyncState {
        let regions = probe.tick_regions();
        let clock = link.clock_handle();
        let cancel = link.cancel().clone();
        let start = clock.now();

        if regions.is_empty() {
            self.state = SyncState::Done;
            self.calibrated_at = Some(start);
            return self.state;
        }

        let mut found: HashMap<TickKind, NaiveDateTime> = HashMap::new();

        if self.settings.disabled {
            debug!("clock synchronisation disabled, assuming host minute alignment");
        } else {
            self.state = SyncState::Synchronizing;
            info!("clock synchronisation started: regions={}", regions.len());

            let deadline = start + TimeDelta::seconds(self.settings.max_duration_secs as i64);
            let interval = Duration::from_millis(self.settings.sample_interval_ms);
            let mut previous: Option<ProbeSample> = None;
            let mut failures = 0u32;

            loop {
                let now = clock.now();
                if now > deadline {
                    break;
                }
                match probe.sample_block(link) {
                    Ok(sample) => {
                        failures = 0;
                        if let Some(prev) = &previous {
                            for region in &regions {
                                if found.contains_key(&region.kind) {
                                    continue;
                                }
                                if tick_observed(region, prev, &sample) {
                                    debug!("tick observed: kind={:?}, at={}", region.kind, now);
                                    found.insert(region.kind, now);
                                }
                            }
                        }
                        previous = Some(sample);
                    }
                    Err(DriverError::Cancelled) => break,
                    Err(e) => {
                        failures += 1;
                        warn!("clock probe failed: failures={}, error={}", failures, e);
                        if failures >= self.settings.max_failures {
                            break;
                        }
                    }
                }

                let complete = regions
                    .iter()
                    .filter(|r| r.required)
                    .all(|r| found.contains_key(&r.kind));
                if complete {
                    break;
                }
                if sleep_cancellable(clock.as_ref(), interval, &cancel).is_err() {
                    break;
                }
            }
        }

        let now = clock.now();
        let minute = host_minute(now);
        let mut missing = Vec::new();
        for region in &regions {
            self.periods.insert(region.kind, region.period_secs);
            let epoch = match found.get(&region.kind) {
                Some(instant) => {
                    let drift = self
                        .epochs
                        .get(&region.kind)
                        .filter(|old| !old.assumed)
                        .map(|old| {
                            phase_shift(old.last_known_instant, *instant, region.period_secs)
                        })
                        .unwrap_or(0);
                    ClockEpoch {
                        last_known_instant: *instant,
                        drift_seconds: drift,
                        assumed: false,
                    }
                }
                None => {
                    if region.required {
                        missing.push(region.kind);
                    }
                    match self.epochs.get(&region.kind) {
                        // A tick seen on an earlier calibration beats a guess.
                        Some(old) if !old.assumed => *old,
                        _ => ClockEpoch {
                            last_known_instant: minute,
                            drift_seconds: 0,
                            assumed: true,
                        },
                    }
                }
            };
            self.epochs.insert(region.kind, epoch);
        }

        self.calibrated_at = Some(now);
        self.state = if missing.is_empty() && !self.settings.disabled {
            info!("clock synchronisation done: epochs={:?}", self.epochs);
            SyncState::Done
        } else {
            if !self.settings.disabled {
                let e = DriverError::ClockSync(format!("ticks not observed: {missing:?}"));
                warn!("{e}; assuming host minute alignment");
            }
            SyncState::Fallback
        };
        self.state
    }

    /// The avoidance windows implied by the current epochs.
    pub fn plan(&self) -> Option<AvoidancePlan> {
        if self.epochs.is_empty() {
            return None;
        }
        let ticks = self
            .epochs
            .iter()
            .filter_map(|(kind, epoch)| {
                let period = *self.periods.get(kind)?;
                Some((epoch.last_known_instant, period))
            })
            .collect();
        Some(AvoidancePlan {
            ticks,
            avoid_start: self.settings.avoid_start_secs,
            avoid_end: self.settings.avoid_end_secs,
        })
    }
}

fn tick_observed(region: &TickRegion, prev: &ProbeSample, sample: &ProbeSample) -> bool {
    match region.kind {
        TickKind::ConsoleMinute => matches!(
            (prev.write_pointer, sample.write_pointer),
            (Some(a), Some(b)) if a != b
        ),
        _ => {
            // A moved write pointer means the block now holds another record.
            if prev.write_pointer != sample.write_pointer {
                return false;
            }
            prev.bytes.get(region.bytes.clone()) != sample.bytes.get(region.bytes.clone())
        }
    }
}

fn host_minute(now: NaiveDateTime) -> NaiveDateTime {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// Change of tick phase between two observations, folded into `(-period/2, period/2]`.
fn phase_shift(old: NaiveDateTime, new: NaiveDateTime, period: i64) -> i64 {
    if period <= 0 {
        return 0;
    }
    let shift = (new - old).num_seconds().rem_euclid(period);
    if shift > period / 2 {
        shift - period
    } else {
        shift
    }
}

/// Read-avoidance windows around each known device tick.
#[derive(Debug, Clone, PartialEq)]
pub struct AvoidancePlan {
    ticks: Vec<(NaiveDateTime, i64)>,
    avoid_start: i64,
    avoid_end: i64,
}

impl AvoidancePlan {
    pub fn new(ticks: Vec<(NaiveDateTime, i64)>, avoid_start: i64, avoid_end: i64) -> Self {
        Self {
            ticks,
            avoid_start,
            avoid_end,
        }
    }

    /// Shortest wait after which `now` is outside every window.
    pub fn delay_needed(&self, now: NaiveDateTime) -> Duration {
        let mut total = 0i64;
        // Clearing one window can land in another; a few passes settle it.
        for _ in 0..4 {
            let probe = now + TimeDelta::seconds(total);
            let extra = self
                .ticks
                .iter()
                .filter_map(|(instant, period)| self.wait_for(*instant, *period, probe))
                .max()
                .unwrap_or(0);
            if extra == 0 {
                break;
            }
            total += extra;
        }
        Duration::from_secs(total.max(0) as u64)
    }

    pub fn is_safe(&self, now: NaiveDateTime) -> bool {
        self.delay_needed(now).is_zero()
    }

    fn wait_for(&self, instant: NaiveDateTime, period: i64, now: NaiveDateTime) -> Option<i64> {
        if period <= 0 {
            return None;
        }
        let phase = (now - instant).num_seconds().rem_euclid(period);
        let signed = if phase > period / 2 { phase - period } else { phase };
        (self.avoid_start..=self.avoid_end)
            .contains(&signed)
            .then(|| self.avoid_end - signed + 1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::host_clock::{HostClock, ManualClock};
    use crate::test_utils::{clock_at, mock_link, MockTransport};

    /// Serves a block whose sensor bytes change at sample `change_at`.
    struct SteppedProbe {
        calls: usize,
        change_at: Option<usize>,
        fail: bool,
    }

    impl ClockProbe for SteppedProbe {
        fn tick_regions(&self) -> Vec<TickRegion> {
            vec![
                TickRegion {
                    kind: TickKind::SensorTick,
                    bytes: 1..16,
                    period_secs: 48,
                    required: true,
                },
                TickRegion {
                    kind: TickKind::ConsoleMinute,
                    bytes: 0..0,
                    period_secs: 60,
                    required: false,
                },
            ]
        }

        fn sample_block(&mut self, _link: &mut Link) -> Result<ProbeSample> {
            let index = self.calls;
            self.calls += 1;
            if self.fail {
                return Err(DriverError::Timeout("probe".into()));
            }
            let mut bytes = vec![0u8; 16];
            if self.change_at.map_or(false, |k| index >= k) {
                bytes[5] = 1;
            }
            Ok(ProbeSample {
                bytes,
                write_pointer: Some(0x100),
            })
        }
    }

    fn setup() -> (Arc<ManualClock>, Link) {
        let clock = Arc::new(clock_at(2024, 2, 1, 10, 0));
        let link = mock_link(MockTransport::echo(), Arc::clone(&clock));
        (clock, link)
    }

    #[test]
    fn test_epoch_is_the_first_changed_sample() {
        let (clock, mut link) = setup();
        let start = clock.now();
        let mut sync = ClockSynchronizer::new(ClockSettings::default());
        let mut probe = SteppedProbe {
            calls: 0,
            change_at: Some(7),
            fail: false,
        };

        assert_eq!(SyncState::Done, sync.synchronize(&mut probe, &mut link));

        let epoch = sync.epoch(TickKind::SensorTick).unwrap();
        assert_eq!(start + TimeDelta::milliseconds(7 * 500), epoch.last_known_instant);
        assert!(!epoch.assumed);
        // Synchronisation stops as soon as the required tick is seen.
        assert_eq!(8, probe.calls);
        assert!(sync.epoch(TickKind::ConsoleMinute).unwrap().assumed);
    }

    #[test]
    fn test_falls_back_when_nothing_changes() {
        let (clock, mut link) = setup();
        let mut sync = ClockSynchronizer::new(ClockSettings::default());
        let mut probe = SteppedProbe {
            calls: 0,
            change_at: None,
            fail: false,
        };

        assert_eq!(SyncState::Fallback, sync.synchronize(&mut probe, &mut link));
        let epoch = sync.epoch(TickKind::SensorTick).unwrap();
        assert!(epoch.assumed);
        assert_eq!(0, epoch.last_known_instant.second());
        // Time-boxed to a minute of sampling.
        assert!(clock.now() <= clock_at(2024, 2, 1, 10, 1).now() + TimeDelta::seconds(1));
    }

    #[test]
    fn test_repeated_probe_failures_end_early() {
        let (_clock, mut link) = setup();
        let mut sync = ClockSynchronizer::new(ClockSettings::default());
        let mut probe = SteppedProbe {
            calls: 0,
            change_at: None,
            fail: true,
        };
        assert_eq!(SyncState::Fallback, sync.synchronize(&mut probe, &mut link));
        assert_eq!(3, probe.calls);
    }

    #[test]
    fn test_recalibration_records_drift() {
        let (clock, mut link) = setup();
        let mut sync = ClockSynchronizer::new(ClockSettings::default());
        let mut probe = SteppedProbe {
            calls: 0,
            change_at: Some(2),
            fail: false,
        };
        sync.synchronize(&mut probe, &mut link);
        let first = sync.epoch(TickKind::SensorTick).unwrap().last_known_instant;
        assert!(!sync.needs_calibration(clock.now()));

        clock.advance(Duration::from_secs(86_400 + 50));
        assert!(sync.needs_calibration(clock.now()));

        let mut probe = SteppedProbe {
            calls: 0,
            change_at: Some(2),
            fail: false,
        };
        sync.synchronize(&mut probe, &mut link);
        let epoch = sync.epoch(TickKind::SensorTick).unwrap();
        let expected = phase_shift(first, epoch.last_known_instant, 48);
        assert_eq!(expected, epoch.drift_seconds);
        assert_ne!(0, epoch.drift_seconds);
    }

    #[test]
    fn test_delay_clears_window() {
        let tick = clock_at(2024, 2, 1, 10, 0).now();
        let plan = AvoidancePlan::new(vec![(tick, 60)], -2, 3);

        // 58 s after the tick is 2 s before the next one.
        let before = tick + TimeDelta::seconds(58);
        assert_eq!(Duration::from_secs(6), plan.delay_needed(before));
        assert!(plan.is_safe(before + TimeDelta::seconds(6)));

        assert_eq!(Duration::from_secs(2), plan.delay_needed(tick + TimeDelta::seconds(62)));
        assert!(plan.is_safe(tick + TimeDelta::seconds(30)));
        assert!(plan.is_safe(tick + TimeDelta::seconds(4)));
    }

    #[test]
    fn test_delay_accounts_for_overlapping_windows() {
        let tick = clock_at(2024, 2, 1, 10, 0).now();
        // Second tick falls 5 s after the first.
        let plan = AvoidancePlan::new(
            vec![(tick, 60), (tick + TimeDelta::seconds(5), 60)],
            -2,
            3,
        );
        // 1 s after the first tick: clear it at +4, which is inside the second window.
        let delay = plan.delay_needed(tick + TimeDelta::seconds(1));
        assert_eq!(Duration::from_secs(8), delay);
        assert!(plan.is_safe(tick + TimeDelta::seconds(9)));
    }

    #[test]
    fn test_phase_shift_folds() {
        let t = clock_at(2024, 2, 1, 10, 0).now();
        assert_eq!(2, phase_shift(t, t + TimeDelta::seconds(98), 48));
        assert_eq!(-2, phase_shift(t, t + TimeDelta::seconds(94), 48));
    }
}
